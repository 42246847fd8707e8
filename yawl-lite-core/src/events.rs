use crate::types::{CaseId, ElementId, SpecId, Timestamp, WorkItemId};
use serde::{Deserialize, Serialize};

/// Engine events — the durable audit trail for every case. Appended through
/// the store before the corresponding announcement leaves the engine; the
/// per-case sequence is a total order consistent with a serial execution of
/// the runner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    CaseStarted {
        case: CaseId,
        spec: SpecId,
    },
    WorkItemEnabled {
        item: WorkItemId,
        task: ElementId,
    },
    WorkItemStarted {
        item: WorkItemId,
        handler: Option<String>,
    },
    WorkItemCompleted {
        item: WorkItemId,
        forced: bool,
    },
    WorkItemSuspended {
        item: WorkItemId,
    },
    WorkItemResumed {
        item: WorkItemId,
    },
    WorkItemFailed {
        item: WorkItemId,
        reason: String,
    },
    WorkItemWithdrawn {
        item: WorkItemId,
    },
    WorkItemCancelled {
        item: WorkItemId,
        reason: String,
    },
    /// A dynamic multi-instance child was added beyond `min`.
    InstanceAdded {
        parent: WorkItemId,
        item: WorkItemId,
    },
    TaskExited {
        case: CaseId,
        task: ElementId,
    },
    /// A composite task launched its sub-net instance.
    SubNetLaunched {
        case: CaseId,
        task: ElementId,
        sub_case: CaseId,
    },
    SubNetCompleted {
        case: CaseId,
        task: ElementId,
        sub_case: CaseId,
    },
    CaseCompleted {
        case: CaseId,
    },
    CaseCancelled {
        case: CaseId,
    },
    CaseSuspended {
        case: CaseId,
    },
    CaseResumed {
        case: CaseId,
    },
    CaseDeadlocked {
        case: CaseId,
        stuck_tasks: Vec<ElementId>,
    },
    /// Predicate evaluation failed during split evaluation; the predicate
    /// was treated as false.
    PredicateError {
        case: CaseId,
        task: ElementId,
        target: ElementId,
        reason: String,
    },
    /// Announcement could not be delivered; the item stays Enabled.
    HandlerUnavailable {
        item: WorkItemId,
        service_ref: String,
    },
    /// Invariant violation; the case was quarantined.
    ConsistencyFailure {
        case: CaseId,
        detail: String,
    },
    /// A work-item timer expired; treated as a completion path.
    TimerExpired {
        item: WorkItemId,
    },
    /// Administrator edited the marking of a (typically deadlocked) case.
    MarkingEdited {
        case: CaseId,
        detail: String,
    },
    /// Advisory response from an exception observer, logged verbatim.
    ExceptionAdvisory {
        case: CaseId,
        hook: String,
        advisory: String,
    },
}

impl EngineEvent {
    /// The case this event belongs to, used for event-log partitioning.
    pub fn case_id(&self) -> CaseId {
        match self {
            EngineEvent::CaseStarted { case, .. }
            | EngineEvent::TaskExited { case, .. }
            | EngineEvent::SubNetLaunched { case, .. }
            | EngineEvent::SubNetCompleted { case, .. }
            | EngineEvent::CaseCompleted { case }
            | EngineEvent::CaseCancelled { case }
            | EngineEvent::CaseSuspended { case }
            | EngineEvent::CaseResumed { case }
            | EngineEvent::CaseDeadlocked { case, .. }
            | EngineEvent::PredicateError { case, .. }
            | EngineEvent::ConsistencyFailure { case, .. }
            | EngineEvent::MarkingEdited { case, .. }
            | EngineEvent::ExceptionAdvisory { case, .. } => case.clone(),
            EngineEvent::WorkItemEnabled { item, .. }
            | EngineEvent::WorkItemStarted { item, .. }
            | EngineEvent::WorkItemCompleted { item, .. }
            | EngineEvent::WorkItemSuspended { item }
            | EngineEvent::WorkItemResumed { item }
            | EngineEvent::WorkItemFailed { item, .. }
            | EngineEvent::WorkItemWithdrawn { item }
            | EngineEvent::WorkItemCancelled { item, .. }
            | EngineEvent::InstanceAdded { item, .. }
            | EngineEvent::HandlerUnavailable { item, .. }
            | EngineEvent::TimerExpired { item } => item_case(item),
        }
    }

    /// Short kind tag for export and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::CaseStarted { .. } => "CaseStarted",
            EngineEvent::WorkItemEnabled { .. } => "WorkItemEnabled",
            EngineEvent::WorkItemStarted { .. } => "WorkItemStarted",
            EngineEvent::WorkItemCompleted { .. } => "WorkItemCompleted",
            EngineEvent::WorkItemSuspended { .. } => "WorkItemSuspended",
            EngineEvent::WorkItemResumed { .. } => "WorkItemResumed",
            EngineEvent::WorkItemFailed { .. } => "WorkItemFailed",
            EngineEvent::WorkItemWithdrawn { .. } => "WorkItemWithdrawn",
            EngineEvent::WorkItemCancelled { .. } => "WorkItemCancelled",
            EngineEvent::InstanceAdded { .. } => "InstanceAdded",
            EngineEvent::TaskExited { .. } => "TaskExited",
            EngineEvent::SubNetLaunched { .. } => "SubNetLaunched",
            EngineEvent::SubNetCompleted { .. } => "SubNetCompleted",
            EngineEvent::CaseCompleted { .. } => "CaseCompleted",
            EngineEvent::CaseCancelled { .. } => "CaseCancelled",
            EngineEvent::CaseSuspended { .. } => "CaseSuspended",
            EngineEvent::CaseResumed { .. } => "CaseResumed",
            EngineEvent::CaseDeadlocked { .. } => "CaseDeadlocked",
            EngineEvent::PredicateError { .. } => "PredicateError",
            EngineEvent::HandlerUnavailable { .. } => "HandlerUnavailable",
            EngineEvent::ConsistencyFailure { .. } => "ConsistencyFailure",
            EngineEvent::TimerExpired { .. } => "TimerExpired",
            EngineEvent::MarkingEdited { .. } => "MarkingEdited",
            EngineEvent::ExceptionAdvisory { .. } => "ExceptionAdvisory",
        }
    }
}

fn item_case(item: &str) -> CaseId {
    crate::types::case_of_work_item(item)
}

/// One row of the append-only event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Per-case sequence number, assigned by the store on append.
    pub seq: u64,
    pub at: Timestamp,
    /// Who caused the event: a handler ref, "engine", or an admin principal.
    pub actor: String,
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_id_extraction() {
        let e = EngineEvent::WorkItemEnabled {
            item: "K3.2:M".to_string(),
            task: "M".to_string(),
        };
        assert_eq!(e.case_id(), "K3");

        let e = EngineEvent::WorkItemCompleted {
            item: "K1:A".to_string(),
            forced: false,
        };
        assert_eq!(e.case_id(), "K1");
    }
}

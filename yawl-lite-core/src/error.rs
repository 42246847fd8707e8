use crate::spec::verifier::VerifyError;
use crate::types::{CaseId, WorkItemId};
use thiserror::Error;

/// Engine error taxonomy. Data, predicate, and handler errors are
/// recoverable; structural errors never reach runtime; consistency errors
/// quarantine the case.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Specification rejected at load time. The load creates nothing.
    #[error("structural verification failed:\n{}", format_verify_errors(.0))]
    Structural(Vec<VerifyError>),

    /// Output document rejected by the task's declared schema. The work item
    /// is marked Failed; the case remains live.
    #[error("output data for {work_item} failed validation: {reason}")]
    DataValidation {
        work_item: WorkItemId,
        reason: String,
    },

    /// Operation not valid for the item's current status, e.g. completing a
    /// not-Executing work item.
    #[error("illegal transition for {work_item}: {detail}")]
    IllegalTransition {
        work_item: WorkItemId,
        detail: String,
    },

    /// Distinguishable idempotent outcome of `start_work_item`.
    #[error("work item {0} already started")]
    AlreadyStarted(WorkItemId),

    /// Operation not valid for the case runner's current status.
    #[error("illegal case state for {case}: {detail}")]
    IllegalCaseState { case: CaseId, detail: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Announcement target is not registered or not reachable. The work item
    /// stays Enabled and is retried on handler (re-)registration.
    #[error("handler unavailable: {0}")]
    HandlerUnavailable(String),

    /// Invariant violation detected at classify time. Fatal for the case:
    /// the runner enters its quarantine state.
    #[error("internal consistency failure in case {case}: {detail}")]
    InternalConsistency { case: CaseId, detail: String },

    /// Caller lacks the admin capability required for marking edits.
    #[error("operation requires the admin capability")]
    AdminRequired,

    /// Persistence backend fault.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

fn format_verify_errors(errors: &[VerifyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type EngineResult<T> = Result<T, EngineError>;

use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Stable string id of a net element (condition or task).
pub type ElementId = String;

/// Id of a loaded specification.
pub type SpecId = String;

/// Root case id — a UUID v7 rendered as an opaque string.
pub type CaseId = String;

/// Canonical work-item id: `caseId:taskId` for single-instance,
/// `caseId.k:taskId` for the k-th multi-instance child.
pub type WorkItemId = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Identifier ───────────────────────────────────────────────

/// A case-qualified token. The root identifier is the case id itself;
/// children append `.k` in creation order (`K1`, `K1.1`, `K1.1.2`, …).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentifierId(pub String);

impl IdentifierId {
    pub fn root(case_id: &str) -> Self {
        Self(case_id.to_string())
    }

    /// The k-th child of this identifier (1-based, creation order).
    pub fn child(&self, k: u32) -> Self {
        Self(format!("{}.{}", self.0, k))
    }

    pub fn is_root(&self) -> bool {
        !self.0.contains('.')
    }

    /// The parent identifier, or `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        self.0.rsplit_once('.').map(|(p, _)| Self(p.to_string()))
    }

    /// The root case id this identifier belongs to.
    pub fn case_id(&self) -> CaseId {
        match self.0.split_once('.') {
            Some((root, _)) => root.to_string(),
            None => self.0.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentifierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the canonical work-item id for an identifier/task pair.
pub fn work_item_id(ident: &IdentifierId, task: &str) -> WorkItemId {
    format!("{}:{}", ident, task)
}

/// Root case id of a work-item id (`caseId[.k]:taskId`).
pub fn case_of_work_item(item_id: &str) -> CaseId {
    let ident = item_id.split(':').next().unwrap_or(item_id);
    match ident.split_once('.') {
        Some((root, _)) => root.to_string(),
        None => ident.to_string(),
    }
}

// ─── Join / split codes ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinCode {
    And,
    Or,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitCode {
    And,
    Or,
    Xor,
}

// ─── Multi-instance attributes ────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationMode {
    /// All instances created at fire time.
    Static,
    /// `min` instances at fire time; more may be added explicitly up to `max`.
    Dynamic,
}

/// Multi-instance parameters. Verified to satisfy `1 ≤ min ≤ threshold ≤ max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstance {
    pub min: u32,
    pub max: u32,
    pub threshold: u32,
    pub creation: CreationMode,
    /// When true the task exits only after every in-flight child finished,
    /// not eagerly at threshold.
    pub wait_for_all: bool,
}

// ─── Execution profile ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interaction {
    Manual,
    Automated,
}

/// Routing decision attached to every atomic task. `service_ref` wins over
/// `codelet` when both are set (the verifier warns on that combination).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub interaction: Interaction,
    pub service_ref: Option<String>,
    pub codelet: Option<String>,
    /// Opaque block consumed only by the default worklist handler.
    pub resourcing: Option<serde_json::Value>,
}

impl ExecutionProfile {
    pub fn manual() -> Self {
        Self {
            interaction: Interaction::Manual,
            service_ref: None,
            codelet: None,
            resourcing: None,
        }
    }

    pub fn codelet(name: impl Into<String>) -> Self {
        Self {
            interaction: Interaction::Automated,
            service_ref: None,
            codelet: Some(name.into()),
            resourcing: None,
        }
    }

    pub fn service(service_ref: impl Into<String>) -> Self {
        Self {
            interaction: Interaction::Automated,
            service_ref: Some(service_ref.into()),
            codelet: None,
            resourcing: None,
        }
    }
}

// ─── Work-item lifecycle ──────────────────────────────────────

/// The 13-state work-item machine. `Parent` marks the umbrella item of a
/// multi-instance task whose children carry the executable lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemStatus {
    Enabled,
    Fired,
    Executing,
    Suspended,
    Parent,
    Complete,
    ForcedComplete,
    Failed,
    Withdrawn,
    Deleted,
    CancelledByCase,
    Deadlocked,
    Discarded,
}

impl WorkItemStatus {
    /// A live item occupies a task instance in the runtime marking.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WorkItemStatus::Enabled
                | WorkItemStatus::Fired
                | WorkItemStatus::Executing
                | WorkItemStatus::Suspended
                | WorkItemStatus::Parent
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live() && !matches!(self, WorkItemStatus::Deadlocked)
    }
}

/// Completion mode for `complete_work_item`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionFlag {
    Normal,
    Force,
}

// ─── Case runner status ───────────────────────────────────────

/// Per-case runner state. Only `Normal` permits firing. `Failed` is the
/// quarantine state entered on an internal consistency violation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerStatus {
    Normal,
    Suspending,
    Suspended,
    Resuming,
    Cancelling,
    Completed,
    Failed,
}

impl RunnerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerStatus::Completed | RunnerStatus::Failed)
    }

    pub fn permits_firing(&self) -> bool {
        matches!(self, RunnerStatus::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_hierarchy() {
        let root = IdentifierId::root("K1");
        assert!(root.is_root());
        assert_eq!(root.parent(), None);

        let child = root.child(2);
        assert_eq!(child.as_str(), "K1.2");
        assert!(!child.is_root());
        assert_eq!(child.parent(), Some(root.clone()));
        assert_eq!(child.case_id(), "K1");

        let grandchild = child.child(1);
        assert_eq!(grandchild.as_str(), "K1.2.1");
        assert_eq!(grandchild.case_id(), "K1");
    }

    #[test]
    fn work_item_id_format() {
        let root = IdentifierId::root("K3");
        assert_eq!(work_item_id(&root, "M"), "K3:M");
        assert_eq!(work_item_id(&root.child(1), "M"), "K3.1:M");
    }

    #[test]
    fn status_liveness() {
        assert!(WorkItemStatus::Enabled.is_live());
        assert!(WorkItemStatus::Parent.is_live());
        assert!(!WorkItemStatus::Complete.is_live());
        assert!(WorkItemStatus::Withdrawn.is_terminal());
        // Deadlocked is neither live nor terminal: it awaits an administrator.
        assert!(!WorkItemStatus::Deadlocked.is_live());
        assert!(!WorkItemStatus::Deadlocked.is_terminal());
    }
}

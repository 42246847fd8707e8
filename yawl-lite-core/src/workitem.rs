//! Work items and their repository.
//!
//! A work item is the external-facing handle for one live task instance.
//! The repository owns every item for every case, with secondary indexes by
//! case, task, and status; mutations are journalled through the store by the
//! engine around each locked case step.

use crate::types::{
    now_ms, CaseId, ElementId, ExecutionProfile, IdentifierId, Timestamp, WorkItemId,
    WorkItemStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ─── Work item ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// `caseId:taskId` / `caseId.k:taskId`. Stable for the item's lifetime.
    pub id: WorkItemId,
    pub case_id: CaseId,
    /// Root identifier of the net instance the task belongs to (differs from
    /// the case id inside a composite sub-net).
    pub net_root: IdentifierId,
    /// The identifier bound to this item: the net root for an offer or a
    /// single-instance task, a child identifier for a multi-instance child.
    pub ident: IdentifierId,
    pub task: ElementId,
    pub status: WorkItemStatus,
    /// Snapshot of the case data document at enablement.
    pub input: Value,
    pub output: Option<Value>,
    /// Snapshot of the task's execution profile at enablement.
    pub profile: ExecutionProfile,
    /// Handler currently holding the item.
    pub handler: Option<String>,
    pub enabled_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Epoch-ms deadline of the task-level timer, if any.
    pub timer_deadline: Option<Timestamp>,
    /// Parent item id for multi-instance children.
    pub parent: Option<WorkItemId>,
    /// Status the item held before suspension, restored on resume.
    pub suspended_from: Option<WorkItemStatus>,
}

impl WorkItem {
    pub fn new(
        ident: IdentifierId,
        net_root: IdentifierId,
        task: &str,
        input: Value,
        profile: ExecutionProfile,
        timer_ms: Option<u64>,
    ) -> Self {
        let enabled_at = now_ms();
        Self {
            id: crate::types::work_item_id(&ident, task),
            case_id: ident.case_id(),
            net_root,
            ident,
            task: task.to_string(),
            status: WorkItemStatus::Enabled,
            input,
            output: None,
            profile,
            handler: None,
            enabled_at,
            started_at: None,
            completed_at: None,
            timer_deadline: timer_ms.map(|ms| enabled_at + ms as i64),
            parent: None,
            suspended_from: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

// ─── Repository ───────────────────────────────────────────────

/// In-memory work-item repository with secondary indexes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkItemRepository {
    items: BTreeMap<WorkItemId, WorkItem>,
    by_case: BTreeMap<CaseId, BTreeSet<WorkItemId>>,
    by_task: BTreeMap<ElementId, BTreeSet<WorkItemId>>,
}

impl WorkItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: WorkItem) {
        self.by_case
            .entry(item.case_id.clone())
            .or_default()
            .insert(item.id.clone());
        self.by_task
            .entry(item.task.clone())
            .or_default()
            .insert(item.id.clone());
        self.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WorkItem> {
        self.items.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<WorkItem> {
        let item = self.items.remove(id)?;
        if let Some(set) = self.by_case.get_mut(&item.case_id) {
            set.remove(id);
            if set.is_empty() {
                self.by_case.remove(&item.case_id);
            }
        }
        if let Some(set) = self.by_task.get_mut(&item.task) {
            set.remove(id);
            if set.is_empty() {
                self.by_task.remove(&item.task);
            }
        }
        Some(item)
    }

    pub fn list_by_case(&self, case_id: &str) -> Vec<&WorkItem> {
        self.by_case
            .get(case_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    pub fn list_by_task(&self, task: &str) -> Vec<&WorkItem> {
        self.by_task
            .get(task)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    pub fn list_by_status(&self, status: WorkItemStatus) -> Vec<&WorkItem> {
        self.items.values().filter(|i| i.status == status).collect()
    }

    /// Live items for one task of one net instance.
    pub fn live_for_task(&self, case_id: &str, net_root: &IdentifierId, task: &str) -> Vec<&WorkItem> {
        self.list_by_case(case_id)
            .into_iter()
            .filter(|i| i.task == task && i.net_root == *net_root && i.is_live())
            .collect()
    }

    pub fn remove_for_case(&mut self, case_id: &str) -> Vec<WorkItem> {
        let ids: Vec<WorkItemId> = self
            .by_case
            .get(case_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(case: &str, k: Option<u32>, task: &str) -> WorkItem {
        let root = IdentifierId::root(case);
        let ident = match k {
            Some(k) => root.child(k),
            None => root.clone(),
        };
        WorkItem::new(
            ident,
            root,
            task,
            Value::Null,
            ExecutionProfile::manual(),
            None,
        )
    }

    #[test]
    fn indexes_stay_consistent() {
        let mut repo = WorkItemRepository::new();
        repo.insert(item("K1", None, "A"));
        repo.insert(item("K1", None, "B"));
        repo.insert(item("K2", None, "A"));

        assert_eq!(repo.len(), 3);
        assert_eq!(repo.list_by_case("K1").len(), 2);
        assert_eq!(repo.list_by_task("A").len(), 2);
        assert_eq!(repo.list_by_status(WorkItemStatus::Enabled).len(), 3);

        repo.remove("K1:A");
        assert_eq!(repo.list_by_case("K1").len(), 1);
        assert_eq!(repo.list_by_task("A").len(), 1);

        let removed = repo.remove_for_case("K2");
        assert_eq!(removed.len(), 1);
        assert!(repo.list_by_case("K2").is_empty());
    }

    #[test]
    fn multi_instance_child_ids() {
        let mut repo = WorkItemRepository::new();
        repo.insert(item("K3", Some(1), "M"));
        repo.insert(item("K3", Some(2), "M"));

        assert!(repo.get("K3.1:M").is_some());
        assert!(repo.get("K3.2:M").is_some());
        assert_eq!(repo.get("K3.1:M").unwrap().case_id, "K3");
    }

    #[test]
    fn timer_deadline_derives_from_enabled_at() {
        let root = IdentifierId::root("K1");
        let item = WorkItem::new(
            root.clone(),
            root,
            "A",
            Value::Null,
            ExecutionProfile::manual(),
            Some(5_000),
        );
        assert_eq!(item.timer_deadline, Some(item.enabled_at + 5_000));
    }
}

use crate::announce::HandlerRef;
use crate::events::{EngineEvent, EventRecord};
use crate::spec::model::Specification;
use crate::store::{CaseSnapshot, CaseStore};
use crate::types::{CaseId, SpecId, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct Inner {
    specifications: HashMap<SpecId, Specification>,
    cases: HashMap<CaseId, CaseSnapshot>,
    handlers: HashMap<String, HandlerRef>,
    events: HashMap<CaseId, Vec<EventRecord>>,
    event_seq: HashMap<CaseId, u64>,
}

/// In-memory implementation of `CaseStore` for tests and single-process
/// deployments.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                specifications: HashMap::new(),
                cases: HashMap::new(),
                handlers: HashMap::new(),
                events: HashMap::new(),
                event_seq: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    // ── Specifications ──

    async fn save_specification(&self, spec: &Specification) -> Result<()> {
        let mut w = self.inner.write().await;
        w.specifications.insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn load_specification(&self, id: &str) -> Result<Option<Specification>> {
        let r = self.inner.read().await;
        Ok(r.specifications.get(id).cloned())
    }

    async fn delete_specification(&self, id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.specifications.remove(id);
        Ok(())
    }

    async fn list_specifications(&self) -> Result<Vec<SpecId>> {
        let r = self.inner.read().await;
        Ok(r.specifications.keys().cloned().collect())
    }

    // ── Cases ──

    async fn save_case(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let mut w = self.inner.write().await;
        w.cases
            .insert(snapshot.state.case_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_case(&self, id: &str) -> Result<Option<CaseSnapshot>> {
        let r = self.inner.read().await;
        Ok(r.cases.get(id).cloned())
    }

    async fn delete_case(&self, id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.cases.remove(id);
        Ok(())
    }

    async fn list_cases(&self) -> Result<Vec<CaseId>> {
        let r = self.inner.read().await;
        Ok(r.cases.keys().cloned().collect())
    }

    // ── Handler registry ──

    async fn save_handler(&self, handler: &HandlerRef) -> Result<()> {
        let mut w = self.inner.write().await;
        w.handlers.insert(handler.reference.clone(), handler.clone());
        Ok(())
    }

    async fn delete_handler(&self, reference: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.handlers.remove(reference);
        Ok(())
    }

    async fn load_handlers(&self) -> Result<Vec<HandlerRef>> {
        let r = self.inner.read().await;
        Ok(r.handlers.values().cloned().collect())
    }

    // ── Event log ──

    async fn append_event(
        &self,
        case_id: &str,
        at: Timestamp,
        actor: &str,
        event: &EngineEvent,
    ) -> Result<u64> {
        let mut w = self.inner.write().await;
        let seq = w.event_seq.entry(case_id.to_string()).or_insert(0);
        *seq += 1;
        let seq = *seq;
        w.events
            .entry(case_id.to_string())
            .or_default()
            .push(EventRecord {
                seq,
                at,
                actor: actor.to_string(),
                event: event.clone(),
            });
        Ok(seq)
    }

    async fn read_events(&self, case_id: &str, from_seq: u64) -> Result<Vec<EventRecord>> {
        let r = self.inner.read().await;
        Ok(r.events
            .get(case_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|rec| rec.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CaseState;
    use crate::spec::model::{NetBuilder, TaskSpec};
    use crate::types::ExecutionProfile;
    use serde_json::json;

    fn spec() -> Specification {
        let net = NetBuilder::new("root")
            .input_condition("i")
            .output_condition("o")
            .task(TaskSpec::atomic("A", ExecutionProfile::manual()).flow_to("o"))
            .flow("i", "A")
            .build();
        Specification::new("s1", net)
    }

    #[tokio::test]
    async fn specification_round_trip() {
        let store = MemoryStore::new();
        store.save_specification(&spec()).await.unwrap();

        let loaded = store.load_specification("s1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "s1");
        assert!(loaded.root().task("A").is_some());

        store.delete_specification("s1").await.unwrap();
        assert!(store.load_specification("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn case_snapshot_round_trip() {
        let store = MemoryStore::new();
        let spec = spec();
        let state = CaseState::launch(&spec, "K1".to_string(), json!({"x": 1}), None);
        let snapshot = CaseSnapshot {
            state,
            items: Vec::new(),
        };

        store.save_case(&snapshot).await.unwrap();
        let loaded = store.load_case("K1").await.unwrap().unwrap();
        assert_eq!(loaded.state.case_id, "K1");
        assert_eq!(loaded.state.data, json!({"x": 1}));
        assert_eq!(store.list_cases().await.unwrap(), vec!["K1".to_string()]);

        store.delete_case("K1").await.unwrap();
        assert!(store.load_case("K1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_log_sequences_per_case() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .append_event(
                    "K1",
                    1000,
                    "engine",
                    &EngineEvent::CaseStarted {
                        case: "K1".to_string(),
                        spec: "s1".to_string(),
                    },
                )
                .await
                .unwrap();
        }
        let seq = store
            .append_event(
                "K2",
                1000,
                "engine",
                &EngineEvent::CaseStarted {
                    case: "K2".to_string(),
                    spec: "s1".to_string(),
                },
            )
            .await
            .unwrap();
        // Sequences are per case, not global.
        assert_eq!(seq, 1);

        let events = store.read_events("K1", 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[1].seq, 3);
    }
}

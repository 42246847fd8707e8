use crate::announce::HandlerRef;
use crate::events::{EngineEvent, EventRecord};
use crate::runner::CaseState;
use crate::spec::model::Specification;
use crate::types::{CaseId, SpecId, Timestamp};
use crate::workitem::WorkItem;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One persistence unit for a case: runner state plus its work items,
/// flushed together before any announcement for the step leaves the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseSnapshot {
    pub state: CaseState,
    pub items: Vec<WorkItem>,
}

/// Persistence trait for all engine state.
///
/// The engine mutates in-memory state under the case lock and writes through
/// this trait before announcing; backends are pluggable (MemoryStore for
/// tests and single-process use, Postgres for production).
#[async_trait]
pub trait CaseStore: Send + Sync {
    // ── Specifications ──

    async fn save_specification(&self, spec: &Specification) -> Result<()>;
    async fn load_specification(&self, id: &str) -> Result<Option<Specification>>;
    async fn delete_specification(&self, id: &str) -> Result<()>;
    async fn list_specifications(&self) -> Result<Vec<SpecId>>;

    // ── Cases ──

    async fn save_case(&self, snapshot: &CaseSnapshot) -> Result<()>;
    async fn load_case(&self, id: &str) -> Result<Option<CaseSnapshot>>;
    /// Remove a terminal (completed or cancelled) case. Its event log stays.
    async fn delete_case(&self, id: &str) -> Result<()>;
    /// Ids of every persisted (non-terminal) case, for crash recovery.
    async fn list_cases(&self) -> Result<Vec<CaseId>>;

    // ── Handler registry ──

    async fn save_handler(&self, handler: &HandlerRef) -> Result<()>;
    async fn delete_handler(&self, reference: &str) -> Result<()>;
    async fn load_handlers(&self) -> Result<Vec<HandlerRef>>;

    // ── Event log (append-only) ──

    /// Append an event and return its per-case sequence number.
    async fn append_event(
        &self,
        case_id: &str,
        at: Timestamp,
        actor: &str,
        event: &EngineEvent,
    ) -> Result<u64>;
    async fn read_events(&self, case_id: &str, from_seq: u64) -> Result<Vec<EventRecord>>;
}

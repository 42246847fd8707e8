use crate::announce::HandlerRef;
use crate::events::{EngineEvent, EventRecord};
use crate::spec::model::Specification;
use crate::store::{CaseSnapshot, CaseStore};
use crate::types::{CaseId, SpecId, Timestamp};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;

/// PostgreSQL-backed implementation of `CaseStore`. State is stored as
/// JSONB snapshots; the event log is an append-only table with a per-case
/// sequence assigned at insert time.
pub struct PostgresCaseStore {
    pool: sqlx::PgPool,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS specifications (
    spec_id    TEXT PRIMARY KEY,
    doc        JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS cases (
    case_id    TEXT PRIMARY KEY,
    spec_id    TEXT NOT NULL,
    status     TEXT NOT NULL,
    snapshot   JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS handlers (
    reference  TEXT PRIMARY KEY,
    doc        JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS case_events (
    case_id    TEXT NOT NULL,
    seq        BIGINT NOT NULL,
    at_ms      BIGINT NOT NULL,
    actor      TEXT NOT NULL,
    doc        JSONB NOT NULL,
    PRIMARY KEY (case_id, seq)
);

CREATE INDEX IF NOT EXISTS case_events_by_case ON case_events (case_id, seq);
"#;

impl PostgresCaseStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to apply yawl-lite schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PostgresCaseStore {
    // ── Specifications ──

    async fn save_specification(&self, spec: &Specification) -> Result<()> {
        let doc = serde_json::to_value(spec)?;
        sqlx::query(
            r#"
            INSERT INTO specifications (spec_id, doc) VALUES ($1, $2)
            ON CONFLICT (spec_id) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&spec.id)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_specification(&self, id: &str) -> Result<Option<Specification>> {
        let row = sqlx::query("SELECT doc FROM specifications WHERE spec_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: serde_json::Value = r.get("doc");
            serde_json::from_value(doc).context("failed to deserialize specification")
        })
        .transpose()
    }

    async fn delete_specification(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM specifications WHERE spec_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_specifications(&self) -> Result<Vec<SpecId>> {
        let rows = sqlx::query("SELECT spec_id FROM specifications")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("spec_id")).collect())
    }

    // ── Cases ──

    async fn save_case(&self, snapshot: &CaseSnapshot) -> Result<()> {
        let doc = serde_json::to_value(snapshot)?;
        let status = format!("{:?}", snapshot.state.status);
        sqlx::query(
            r#"
            INSERT INTO cases (case_id, spec_id, status, snapshot, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (case_id) DO UPDATE SET
                spec_id = EXCLUDED.spec_id,
                status = EXCLUDED.status,
                snapshot = EXCLUDED.snapshot,
                updated_at = now()
            "#,
        )
        .bind(&snapshot.state.case_id)
        .bind(&snapshot.state.spec_id)
        .bind(status)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_case(&self, id: &str) -> Result<Option<CaseSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM cases WHERE case_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: serde_json::Value = r.get("snapshot");
            serde_json::from_value(doc).context("failed to deserialize case snapshot")
        })
        .transpose()
    }

    async fn delete_case(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cases WHERE case_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_cases(&self) -> Result<Vec<CaseId>> {
        let rows = sqlx::query("SELECT case_id FROM cases")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("case_id")).collect())
    }

    // ── Handler registry ──

    async fn save_handler(&self, handler: &HandlerRef) -> Result<()> {
        let doc = serde_json::to_value(handler)?;
        sqlx::query(
            r#"
            INSERT INTO handlers (reference, doc) VALUES ($1, $2)
            ON CONFLICT (reference) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&handler.reference)
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_handler(&self, reference: &str) -> Result<()> {
        sqlx::query("DELETE FROM handlers WHERE reference = $1")
            .bind(reference)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_handlers(&self) -> Result<Vec<HandlerRef>> {
        let rows = sqlx::query("SELECT doc FROM handlers")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                serde_json::from_value(doc).context("failed to deserialize handler")
            })
            .collect()
    }

    // ── Event log ──

    async fn append_event(
        &self,
        case_id: &str,
        at: Timestamp,
        actor: &str,
        event: &EngineEvent,
    ) -> Result<u64> {
        let doc = serde_json::to_value(event)?;
        let row = sqlx::query(
            r#"
            INSERT INTO case_events (case_id, seq, at_ms, actor, doc)
            SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4
            FROM case_events WHERE case_id = $1
            RETURNING seq
            "#,
        )
        .bind(case_id)
        .bind(at)
        .bind(actor)
        .bind(doc)
        .fetch_one(&self.pool)
        .await?;
        let seq: i64 = row.get("seq");
        Ok(seq as u64)
    }

    async fn read_events(&self, case_id: &str, from_seq: u64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, at_ms, actor, doc FROM case_events
            WHERE case_id = $1 AND seq >= $2
            ORDER BY seq
            "#,
        )
        .bind(case_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                let event: EngineEvent =
                    serde_json::from_value(doc).context("failed to deserialize event")?;
                Ok(EventRecord {
                    seq: r.get::<i64, _>("seq") as u64,
                    at: r.get("at_ms"),
                    actor: r.get("actor"),
                    event,
                })
            })
            .collect()
    }
}

//! Postgres-backed record store.
//!
//! Records live in a single `session_records` table with JSONB payload
//! columns. Upserts go through `ON CONFLICT (id) DO UPDATE` so retries and
//! concurrent writers converge on the latest row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::record::{Record, RecordInput, RecordState};

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize the schema. Idempotent.
    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_records (
                id UUID PRIMARY KEY,
                session_id UUID NOT NULL,
                node_instance_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                inputs JSONB NOT NULL DEFAULT '[]',
                output JSONB NOT NULL DEFAULT '{}',
                state TEXT NOT NULL,
                events_emitted JSONB NOT NULL DEFAULT '[]',
                context JSONB,
                error TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                last_modified_at TIMESTAMPTZ NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT false
            );

            -- Incremental reloads scan by modification time within a session
            CREATE INDEX IF NOT EXISTS idx_session_records_modified
                ON session_records(session_id, last_modified_at);

            CREATE INDEX IF NOT EXISTS idx_session_records_node
                ON session_records(session_id, node_instance_id)
                WHERE NOT deleted;
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn fetch_all(&self, session_id: Uuid) -> StoreResult<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT id, node_instance_id, node_type, inputs, output, state,
                   events_emitted, context, error, started_at, completed_at,
                   last_modified_at, deleted
            FROM session_records
            WHERE session_id = $1 AND NOT deleted
            ORDER BY started_at
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn fetch_since(
        &self,
        session_id: Uuid,
        mark: DateTime<Utc>,
    ) -> StoreResult<Vec<Record>> {
        let rows = sqlx::query(
            r#"
            SELECT id, node_instance_id, node_type, inputs, output, state,
                   events_emitted, context, error, started_at, completed_at,
                   last_modified_at, deleted
            FROM session_records
            WHERE session_id = $1 AND last_modified_at > $2
            ORDER BY started_at
            "#,
        )
        .bind(session_id)
        .bind(mark)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn upsert(&self, session_id: Uuid, record: &Record) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_records (
                id, session_id, node_instance_id, node_type, inputs, output,
                state, events_emitted, context, error, started_at,
                completed_at, last_modified_at, deleted
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                inputs = EXCLUDED.inputs,
                output = EXCLUDED.output,
                state = EXCLUDED.state,
                events_emitted = EXCLUDED.events_emitted,
                context = EXCLUDED.context,
                error = EXCLUDED.error,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                last_modified_at = EXCLUDED.last_modified_at,
                deleted = EXCLUDED.deleted
            "#,
        )
        .bind(record.record_id)
        .bind(session_id)
        .bind(&record.node_instance_id)
        .bind(&record.node_type)
        .bind(serde_json::to_value(&record.inputs)?)
        .bind(Value::Object(record.output.clone()))
        .bind(record.state.as_str())
        .bind(serde_json::to_value(&record.events_emitted)?)
        .bind(record.context.clone())
        .bind(record.error.as_deref())
        .bind(record.start_time)
        .bind(record.completion_time)
        .bind(record.last_modified_time)
        .bind(record.deleted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_deleted(&self, session_id: Uuid, record_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE session_records
            SET deleted = true, last_modified_at = NOW()
            WHERE session_id = $1 AND id = $2
            "#,
        )
        .bind(session_id)
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> StoreResult<Record> {
    let state_str: String = row.get("state");
    let state = RecordState::parse(&state_str)
        .ok_or_else(|| StoreError::Malformed(format!("unknown record state '{state_str}'")))?;

    let inputs: Vec<RecordInput> = serde_json::from_value(row.get::<Value, _>("inputs"))?;
    let output = match row.get::<Value, _>("output") {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Malformed(format!(
                "output column is not an object: {other}"
            )));
        }
    };
    let events_emitted: Vec<String> =
        serde_json::from_value(row.get::<Value, _>("events_emitted"))?;

    Ok(Record {
        record_id: row.get("id"),
        node_instance_id: row.get("node_instance_id"),
        node_type: row.get("node_type"),
        inputs,
        output,
        state,
        events_emitted,
        context: row.get::<Option<Value>, _>("context"),
        error: row.get("error"),
        start_time: row.get("started_at"),
        completion_time: row.get("completed_at"),
        last_modified_time: row.get("last_modified_at"),
        deleted: row.get("deleted"),
    })
}

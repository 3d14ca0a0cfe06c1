//! Postgres outbox store.

use crate::{NewOutboxEvent, OutboxClaim, OutboxError, OutboxEvent, OutboxResult, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashSet;
use tracing::debug;

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    event_id      BIGSERIAL PRIMARY KEY,
    event_name    TEXT NOT NULL,
    event_payload JSONB NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    relayed       BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS outbox_unrelayed_idx
    ON outbox (created_at) WHERE NOT relayed;
"#;

/// Postgres implementation of the outbox store.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` inside a dedicated transaction
/// that stays open for the claim's lifetime, so at most one relayer
/// processes a given event even when several processes poll concurrently.
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the outbox table and its partial index if absent.
    pub async fn ensure_schema(&self) -> OutboxResult<()> {
        sqlx::raw_sql(CREATE_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Append events inside the caller's existing transaction.
    ///
    /// The events become visible to the relay only when the caller commits;
    /// if the business transaction rolls back, they never exist. Returns
    /// the assigned ids in input order.
    pub async fn append(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[NewOutboxEvent],
    ) -> OutboxResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            let row = sqlx::query(
                "INSERT INTO outbox (event_name, event_payload) VALUES ($1, $2) RETURNING event_id",
            )
            .bind(&event.event_name)
            .bind(&event.event_payload)
            .fetch_one(&mut **tx)
            .await?;
            ids.push(row.try_get::<i64, _>("event_id")?);
        }
        debug!(count = ids.len(), "Appended outbox events");
        Ok(ids)
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_unrelayed(&self, limit: i64) -> OutboxResult<Box<dyn OutboxClaim>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT event_id, event_name, event_payload, created_at, relayed
            FROM outbox
            WHERE NOT relayed
            ORDER BY created_at ASC, event_id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let events = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    event_id: row.try_get("event_id")?,
                    event_name: row.try_get("event_name")?,
                    event_payload: row.try_get("event_payload")?,
                    created_at: row.try_get("created_at")?,
                    relayed: row.try_get("relayed")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = events.len(), "Claimed unrelayed events");
        Ok(Box::new(PgClaim { tx, events }))
    }

    async fn count_unrelayed(&self) -> OutboxResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS unrelayed FROM outbox WHERE NOT relayed")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("unrelayed")?)
    }

    async fn clean_relayed_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE relayed AND created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// A claimed batch holding its row locks in an open transaction.
///
/// Dropping the claim without marking rolls the transaction back, releasing
/// the locks and leaving every event unrelayed — this is what makes a
/// relay crash mid-batch safe (the events are republished on restart).
struct PgClaim {
    tx: Transaction<'static, Postgres>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxClaim for PgClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_relayed(self: Box<Self>, ids: &[i64]) -> OutboxResult<()> {
        let Self { mut tx, events } = *self;

        let claimed: HashSet<i64> = events.iter().map(|e| e.event_id).collect();
        if let Some(&stray) = ids.iter().find(|id| !claimed.contains(id)) {
            return Err(OutboxError::NotClaimed(stray));
        }

        if !ids.is_empty() {
            sqlx::query("UPDATE outbox SET relayed = TRUE WHERE event_id = ANY($1)")
                .bind(ids)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(marked = ids.len(), "Marked events relayed");
        Ok(())
    }
}

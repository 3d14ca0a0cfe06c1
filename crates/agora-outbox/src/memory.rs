//! In-memory outbox store for tests.

use crate::{NewOutboxEvent, OutboxClaim, OutboxError, OutboxEvent, OutboxResult, OutboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<OutboxEvent>,
    claimed: HashSet<i64>,
}

/// In-memory implementation of the outbox store.
///
/// Mirrors the Postgres store's claim semantics: rows claimed by one
/// claimer are invisible to others until the claim is marked or dropped.
/// Used by relay-loop tests and by downstream crates' tests in place of a
/// live database.
#[derive(Clone, Default)]
pub struct MemoryOutboxStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append events, assigning monotonically increasing ids.
    ///
    /// The in-memory store has no transactions; appends are visible
    /// immediately, which is what relay tests want.
    pub fn append(&self, events: &[NewOutboxEvent]) -> Vec<i64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.push(OutboxEvent {
                event_id: id,
                event_name: event.event_name.clone(),
                event_payload: event.event_payload.clone(),
                created_at: Utc::now(),
                relayed: false,
            });
            ids.push(id);
        }
        ids
    }

    /// Snapshot of all rows, for assertions.
    pub fn rows(&self) -> Vec<OutboxEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rows
            .clone()
    }

    /// Ids of rows currently marked relayed, in event order.
    pub fn relayed_ids(&self) -> Vec<i64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .rows
            .iter()
            .filter(|r| r.relayed)
            .map(|r| r.event_id)
            .collect()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_unrelayed(&self, limit: i64) -> OutboxResult<Box<dyn OutboxClaim>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let events: Vec<OutboxEvent> = inner
            .rows
            .iter()
            .filter(|r| !r.relayed && !inner.claimed.contains(&r.event_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        for event in &events {
            inner.claimed.insert(event.event_id);
        }
        Ok(Box::new(MemoryClaim {
            store: self.inner.clone(),
            events,
        }))
    }

    async fn count_unrelayed(&self) -> OutboxResult<i64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.rows.iter().filter(|r| !r.relayed).count() as i64)
    }

    async fn clean_relayed_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.rows.len();
        inner.rows.retain(|r| !(r.relayed && r.created_at < cutoff));
        Ok((before - inner.rows.len()) as u64)
    }
}

struct MemoryClaim {
    store: Arc<Mutex<Inner>>,
    events: Vec<OutboxEvent>,
}

#[async_trait]
impl OutboxClaim for MemoryClaim {
    fn events(&self) -> &[OutboxEvent] {
        &self.events
    }

    async fn mark_relayed(self: Box<Self>, ids: &[i64]) -> OutboxResult<()> {
        let claimed: HashSet<i64> = self.events.iter().map(|e| e.event_id).collect();
        if let Some(&stray) = ids.iter().find(|id| !claimed.contains(id)) {
            return Err(OutboxError::NotClaimed(stray));
        }

        let mut inner = self.store.lock().unwrap_or_else(|e| e.into_inner());
        for row in inner.rows.iter_mut() {
            if ids.contains(&row.event_id) {
                row.relayed = true;
            }
        }
        // Claim release happens in Drop.
        Ok(())
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        // Dropping an uncommitted claim models a relay crash: the rows
        // become claimable again with relayed still false.
        let mut inner = self.store.lock().unwrap_or_else(|e| e.into_inner());
        for event in &self.events {
            inner.claimed.remove(&event.event_id);
        }
    }
}

//! The relay loop: drains the outbox into the broker in `event_id` order.
//!
//! One logical worker per process. Multiple processes may run it against the
//! same store; claim-time lock skipping keeps them on disjoint event sets.

use crate::RelayResult;
use agora_broker::{Broker, EventEnvelope};
use agora_lifecycle::LifecycleManager;
use agora_outbox::{OutboxEvent, OutboxStore};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max events claimed per batch.
    pub prefetch: i64,
    /// Idle sleep between empty checks.
    pub poll_interval: Duration,
    /// First backoff after a halted batch; grows x3 per consecutive halt.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backlog size above which the falling-behind warning fires.
    pub backlog_warn_threshold: i64,
    /// Minimum gap between backlog warnings.
    pub backlog_warn_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            poll_interval: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backlog_warn_threshold: 1_000,
            backlog_warn_interval: Duration::from_secs(60),
        }
    }
}

/// Cloneable producer-side handle: lets same-process writers bump the
/// advisory backlog counter so the idle check needs no COUNT query.
#[derive(Clone)]
pub struct RelayHandle {
    unrelayed: Arc<AtomicI64>,
}

impl RelayHandle {
    /// Record that `n` events were just committed to the outbox.
    pub fn note_appended(&self, n: i64) {
        self.unrelayed.fetch_add(n, Ordering::SeqCst);
    }

    /// Advisory backlog size. Correctness rests on the store's `relayed`
    /// column, not on this number.
    pub fn backlog(&self) -> i64 {
        self.unrelayed.load(Ordering::SeqCst).max(0)
    }
}

enum Batch {
    /// Claim came back empty: another relayer got there first.
    Empty,
    /// Every claimed event published and marked.
    Complete(usize),
    /// Publish or persistence failure; any published prefix was marked.
    Halted,
}

pub struct RelayLoop {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    lifecycle: Arc<LifecycleManager>,
    config: RelayConfig,
    unrelayed: Arc<AtomicI64>,
    backoff: Duration,
    last_backlog_warn: Option<Instant>,
}

impl RelayLoop {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        lifecycle: Arc<LifecycleManager>,
        config: RelayConfig,
    ) -> Self {
        let backoff = config.initial_backoff;
        Self {
            store,
            broker,
            lifecycle,
            config,
            unrelayed: Arc::new(AtomicI64::new(0)),
            backoff,
            last_backlog_warn: None,
        }
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            unrelayed: Arc::clone(&self.unrelayed),
        }
    }

    /// Seed the backlog counter from a real count.
    pub async fn sync_backlog(&self) -> RelayResult<i64> {
        let count = self.store.count_unrelayed().await?;
        self.unrelayed.store(count, Ordering::SeqCst);
        Ok(count)
    }

    /// Run until the lifecycle manager begins shutting down.
    pub async fn run(mut self) {
        match self.sync_backlog().await {
            Ok(count) => info!(backlog = count, "Relay loop started"),
            Err(e) => error!(error = %e, "Initial backlog count failed, starting at zero"),
        }
        while !self.lifecycle.is_shutting_down() {
            self.step().await;
        }
        info!("Relay loop stopped");
    }

    /// Drive a fixed number of iterations. Each iteration is one idle sleep
    /// or one batch attempt (including its backoff sleep if it halted).
    pub async fn run_iterations(&mut self, iterations: usize) {
        for _ in 0..iterations {
            if self.lifecycle.is_shutting_down() {
                break;
            }
            self.step().await;
        }
    }

    async fn step(&mut self) {
        self.maybe_warn_backlog();
        if self.unrelayed.load(Ordering::SeqCst) <= 0 {
            tokio::time::sleep(self.config.poll_interval).await;
            return;
        }
        match self.drain_batch().await {
            Batch::Empty => {
                // The counter was stale. Either other relayers drained these
                // rows, or they still hold claims over them; a real count
                // distinguishes the two so rows released by a crashed claimer
                // are not forgotten until the next append.
                match self.store.count_unrelayed().await {
                    Ok(count) => self.unrelayed.store(count, Ordering::SeqCst),
                    Err(e) => {
                        warn!(error = %e, "Backlog recount failed, assuming drained");
                        self.unrelayed.store(0, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
            Batch::Complete(n) => {
                debug!(relayed = n, "Batch relayed");
                self.backoff = self.config.initial_backoff;
                // No sleep: immediately claim again to drain bursts.
            }
            Batch::Halted => {
                tokio::time::sleep(self.backoff).await;
                self.backoff = (self.backoff * 3).min(self.config.max_backoff);
            }
        }
    }

    /// Claim one batch and publish it in ascending `event_id` order, halting
    /// at the first failure so no event is ever relayed out of order. Only
    /// the successfully published prefix is marked relayed.
    async fn drain_batch(&mut self) -> Batch {
        let claim = match self.store.claim_unrelayed(self.config.prefetch).await {
            Ok(claim) => claim,
            Err(e) => {
                error!(error = %e, "Outbox claim failed");
                return Batch::Halted;
            }
        };
        let events: Vec<OutboxEvent> = claim.events().to_vec();
        if events.is_empty() {
            return Batch::Empty;
        }

        let mut published: Vec<i64> = Vec::with_capacity(events.len());
        let mut halted = false;
        for event in &events {
            let envelope = EventEnvelope::new(event.event_name.clone(), event.event_payload.clone());
            match self.broker.publish(&event.event_name, &envelope).await {
                Ok(true) => published.push(event.event_id),
                Ok(false) => {
                    error!(
                        event_id = event.event_id,
                        event = %event.event_name,
                        "Broker rejected event; halting batch, operator attention required"
                    );
                    halted = true;
                    break;
                }
                Err(e) => {
                    error!(
                        event_id = event.event_id,
                        event = %event.event_name,
                        error = %e,
                        "Publish failed; halting batch, operator attention required"
                    );
                    halted = true;
                    break;
                }
            }
        }

        let relayed = published.len();
        if let Err(e) = claim.mark_relayed(&published).await {
            error!(error = %e, "Marking relayed failed; events will be republished");
            return Batch::Halted;
        }
        self.unrelayed.fetch_sub(relayed as i64, Ordering::SeqCst);
        if halted {
            Batch::Halted
        } else {
            Batch::Complete(relayed)
        }
    }

    fn maybe_warn_backlog(&mut self) {
        let backlog = self.unrelayed.load(Ordering::SeqCst);
        if backlog <= self.config.backlog_warn_threshold {
            return;
        }
        let now = Instant::now();
        let due = match self.last_backlog_warn {
            Some(last) => now.duration_since(last) >= self.config.backlog_warn_interval,
            None => true,
        };
        if due {
            warn!(
                backlog,
                threshold = self.config.backlog_warn_threshold,
                "Relay backlog above threshold; relay may be falling behind"
            );
            self.last_backlog_warn = Some(now);
        }
    }
}

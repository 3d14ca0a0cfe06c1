//! Store contract consumed by the relay worker.

use crate::{OutboxEvent, OutboxResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read side of the outbox, consumed by the relay loop.
///
/// Appending happens through the concrete store (it must run inside the
/// caller's database transaction, which an object-safe trait cannot
/// express); claiming and marking go through this trait so the relay loop
/// can run against the in-memory store in tests.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim the oldest `limit` unrelayed events.
    ///
    /// Rows already locked by a concurrent claimer are skipped rather than
    /// waited on, so relayers make forward progress on disjoint event sets.
    /// The claim holds its locks until [`OutboxClaim::mark_relayed`] commits
    /// it or the claim is dropped (crash/rollback), in which case the events
    /// stay unrelayed and become claimable again.
    async fn claim_unrelayed(&self, limit: i64) -> OutboxResult<Box<dyn OutboxClaim>>;

    /// Real count of unrelayed events. Used once at relay startup to seed
    /// the in-memory backlog counter; never called on the hot path.
    async fn count_unrelayed(&self) -> OutboxResult<i64>;

    /// Retention: delete relayed rows older than the cutoff.
    async fn clean_relayed_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64>;
}

/// A claimed batch of unrelayed events, in ascending `event_id` order.
#[async_trait]
pub trait OutboxClaim: Send {
    /// The claimed events, oldest first.
    fn events(&self) -> &[OutboxEvent];

    /// Mark the given events relayed and commit the claim.
    ///
    /// `ids` must be a subset of the claimed events; passing the published
    /// prefix after a mid-batch failure is the normal case. Idempotent at
    /// the row level: re-marking an already-relayed id is a no-op.
    async fn mark_relayed(self: Box<Self>, ids: &[i64]) -> OutboxResult<()>;
}

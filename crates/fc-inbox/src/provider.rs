//! The storage provider abstract contract. Every backend
//! (durable SQL, Redis, in-memory) implements `StorageProvider`;
//! FIFO-specific and maintenance operations are separate optional
//! capability traits a strategy or the orchestrator probes for.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{DeadLetterMessage, HealthMetrics, InboxMessage, NewMessage};

/// Buffered outcome of one captured batch, applied as a single atomic
/// unit. Building this incrementally and calling `apply_results` once
/// per batch is the hot path: never split it into four separate calls.
#[derive(Debug, Clone, Default)]
pub struct ApplyResultsBatch {
    pub to_complete: Vec<String>,
    pub to_fail: Vec<String>,
    pub to_release: Vec<String>,
    pub to_dead_letter: Vec<DeadLetterEntry>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub id: String,
    pub reason: String,
}

impl ApplyResultsBatch {
    pub fn is_empty(&self) -> bool {
        self.to_complete.is_empty()
            && self.to_fail.is_empty()
            && self.to_release.is_empty()
            && self.to_dead_letter.is_empty()
    }
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Pre-checks dedup, applies collapse-key deletion, inserts with
    /// `captured_at = None`. Silent no-op if a non-expired dedup record
    /// already exists for `deduplication_id`.
    async fn write(&self, message: NewMessage) -> Result<()>;

    /// Same semantics as `write`, batched atomically per backend
    /// transaction unit. Collapse-key deletion applies per distinct key.
    async fn write_batch(&self, messages: Vec<NewMessage>) -> Result<()>;

    /// Selects up to `read_batch_size` eligible rows and durably records
    /// `captured_at = now, captured_by = worker_id` on all of them as one
    /// atomic operation. See below for the exact eligibility and FIFO
    /// group-lock acquisition rules.
    async fn read_and_capture(&self, worker_id: &str, read_batch_size: u32) -> Result<Vec<InboxMessage>>;

    /// Refreshes `captured_at` for every message in `message_ids` still
    /// owned by `worker_id`. Returns the number of leases refreshed.
    /// Wrong-worker or completed messages are ignored, not an error.
    async fn extend_locks(
        &self,
        worker_id: &str,
        message_ids: &[String],
        new_captured_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Applies a batch's buffered outcomes as one atomic unit. Empty
    /// input is a no-op and performs no I/O.
    async fn apply_results(&self, batch: ApplyResultsBatch) -> Result<()>;

    /// Ordered by `moved_at` ascending. Empty when dead letter is
    /// disabled for this provider.
    async fn read_dead_letters(&self, max: u32) -> Result<Vec<DeadLetterMessage>>;

    /// Deletes dead-letter records at or before `cutoff`. Returns the
    /// number removed. No-op provider-side if dead letter is disabled.
    async fn cleanup_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes dedup records at or before `cutoff`, in batches of
    /// `batch_size` for durable backends (until exhausted for the
    /// current cycle); volatile backends may ignore `batch_size` and do
    /// a single pass. Returns the number removed in this call.
    async fn cleanup_dedup_records(&self, cutoff: DateTime<Utc>, batch_size: u32) -> Result<u64>;

    /// FIFO-specific operations, when this provider's inbox is a FIFO
    /// kind. `None` for providers backing non-FIFO inboxes.
    fn fifo_capability(&self) -> Option<&dyn FifoCapability> {
        None
    }

    /// Migration and health-metrics, when supported.
    fn maintenance_capability(&self) -> Option<&dyn MaintenanceCapability> {
        None
    }
}

/// FIFO group-lock operations. Optional: strategies and the orchestrator
/// check for this capability at construction and fall back to a simpler
/// release path (just `apply_results`) when it is absent — e.g. for a
/// provider backing a non-FIFO inbox.
#[async_trait]
pub trait FifoCapability: Send + Sync {
    /// Marks the listed group locks free. Idempotent: unknown groups
    /// are ignored.
    async fn release_group_locks(&self, group_ids: &[String]) -> Result<()>;

    /// Combines `to_release` semantics for `message_ids` with
    /// `release_group_locks` for their distinct group ids, in one
    /// atomic unit. Used during graceful shutdown.
    async fn release_messages_and_group_locks(&self, message_ids: &[String]) -> Result<()>;

    /// Releases group locks whose `locked_at <= cutoff`. Durable
    /// backends only; in-memory/Redis providers may implement
    /// this as a no-op returning 0 since their locks already expire via
    /// TTL/implicit validity window.
    async fn cleanup_expired_group_locks(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait MaintenanceCapability: Send + Sync {
    /// Idempotent schema/keyspace preparation.
    async fn migrate(&self) -> Result<()>;

    async fn health_metrics(&self) -> Result<HealthMetrics>;
}

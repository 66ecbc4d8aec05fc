//! Durable message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The durable unit stored by a `StorageProvider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: String,
    pub inbox_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub captured_by: Option<String>,
}

impl InboxMessage {
    /// `(CapturedAt == null) <=> (CapturedBy == null)` must hold for every
    /// row that leaves a storage provider.
    pub fn lease_fields_consistent(&self) -> bool {
        self.captured_at.is_some() == self.captured_by.is_some()
    }

    pub fn is_captured(&self) -> bool {
        self.captured_at.is_some()
    }
}

/// A message as handed to `write`/`write_batch`, before a storage
/// provider assigns lease fields. `id` and `received_at` may be supplied
/// by the caller (`HasExternalId`/`HasReceivedAt` capabilities) or left
/// `None` for the provider to generate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Option<String>,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub collapse_key: Option<String>,
    pub deduplication_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: None,
            message_type: message_type.into(),
            payload,
            group_id: None,
            collapse_key: None,
            deduplication_id: None,
            received_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_collapse_key(mut self, collapse_key: impl Into<String>) -> Self {
        self.collapse_key = Some(collapse_key.into());
        self
    }

    pub fn with_deduplication_id(mut self, deduplication_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    /// Finalize into a pending `InboxMessage` for a given inbox, filling
    /// in any caller-omitted id/received_at.
    pub fn into_message(self, inbox_name: &str, now: DateTime<Utc>) -> InboxMessage {
        InboxMessage {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            inbox_name: inbox_name.to_string(),
            message_type: self.message_type,
            payload: self.payload,
            group_id: self.group_id,
            collapse_key: self.collapse_key,
            deduplication_id: self.deduplication_id,
            attempts_count: 0,
            received_at: self.received_at.unwrap_or(now),
            captured_at: None,
            captured_by: None,
        }
    }
}

/// A terminal copy of an `InboxMessage`. Never re-enters the pending pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub id: String,
    pub inbox_name: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub group_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub failure_reason: String,
    pub moved_at: DateTime<Utc>,
}

/// `(InboxName, DeduplicationId, CreatedAt)`, unique on the first two.
#[derive(Debug, Clone)]
pub struct DeduplicationRecord {
    pub inbox_name: String,
    pub deduplication_id: String,
    pub created_at: DateTime<Utc>,
}

/// `(InboxName, GroupId, LockedAt, LockedBy)`. `locked_at == None` means
/// free; a lock is effective while `now - locked_at <= MaxProcessingTime`.
#[derive(Debug, Clone)]
pub struct GroupLock {
    pub inbox_name: String,
    pub group_id: String,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

/// Snapshot returned by the storage provider's optional health capability.
#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    pub pending_count: u64,
    pub captured_count: u64,
    pub dead_letter_count: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// The outcome a handler returns for one message.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Success,
    Retry,
    Failed { error: Option<String> },
    MoveToDeadLetter { reason: Option<String> },
}

impl HandlerOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        HandlerOutcome::Failed { error: Some(error.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_generates_id_and_timestamp() {
        let now = Utc::now();
        let msg = NewMessage::new("order.created", b"{}".to_vec()).into_message("orders", now);
        assert!(!msg.id.is_empty());
        assert_eq!(msg.received_at, now);
        assert_eq!(msg.attempts_count, 0);
        assert!(msg.lease_fields_consistent());
        assert!(!msg.is_captured());
    }

    #[test]
    fn caller_supplied_id_is_preserved() {
        let now = Utc::now();
        let msg = NewMessage::new("order.created", b"{}".to_vec())
            .with_id("caller-id-1")
            .into_message("orders", now);
        assert_eq!(msg.id, "caller-id-1");
    }
}

//! In-memory storage provider: a single coarse lock approximating the
//! durable store's atomicity, for tests and single-process deployments.
//! Mirrors the single-`Mutex`-over-a-`VecDeque` shape `GlobalBuffer`
//! uses for its in-process queue elsewhere in this ecosystem.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use fc_common::Clock;

use crate::error::Result;
use crate::model::{DeadLetterMessage, HealthMetrics, InboxMessage, NewMessage};
use crate::provider::{ApplyResultsBatch, FifoCapability, MaintenanceCapability, StorageProvider};

struct GroupLockEntry {
    locked_at: DateTime<Utc>,
    locked_by: String,
}

#[derive(Default)]
struct MemoryState {
    pending: Vec<InboxMessage>,
    dead_letters: Vec<DeadLetterMessage>,
    dedup: HashMap<String, DateTime<Utc>>,
    group_locks: HashMap<String, GroupLockEntry>,
}

pub struct MemoryProvider {
    inbox_name: String,
    is_fifo: bool,
    max_processing_time: Duration,
    enable_dedup: bool,
    deduplication_interval: Duration,
    enable_dead_letter: bool,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    pub fn new(
        inbox_name: impl Into<String>,
        is_fifo: bool,
        max_processing_time: Duration,
        enable_dedup: bool,
        deduplication_interval: Duration,
        enable_dead_letter: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inbox_name: inbox_name.into(),
            is_fifo,
            max_processing_time,
            enable_dedup,
            deduplication_interval,
            enable_dead_letter,
            clock,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lease_expired(&self, captured_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - captured_at).to_std().unwrap_or(Duration::ZERO) > self.max_processing_time
    }

    fn group_locked_by_other(&self, state: &MemoryState, group_id: &str, worker_id: &str, now: DateTime<Utc>) -> bool {
        match state.group_locks.get(group_id) {
            None => false,
            Some(lock) => {
                lock.locked_by != worker_id && !self.lease_expired(lock.locked_at, now)
            }
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn write(&self, message: NewMessage) -> Result<()> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;

        if let Some(existing_id) = &message.id {
            if state.pending.iter().any(|m| &m.id == existing_id) {
                return Ok(());
            }
        }

        if self.enable_dedup {
            if let Some(dedup_id) = &message.deduplication_id {
                if let Some(created_at) = state.dedup.get(dedup_id) {
                    if (now - *created_at).to_std().unwrap_or(Duration::ZERO) < self.deduplication_interval {
                        return Ok(());
                    }
                }
            }
        }

        if let Some(collapse_key) = &message.collapse_key {
            state.pending.retain(|m| m.collapse_key.as_deref() != Some(collapse_key.as_str()) || m.is_captured());
        }

        let dedup_id = message.deduplication_id.clone();
        let inbox_message = message.into_message(&self.inbox_name, now);
        state.pending.push(inbox_message);

        if self.enable_dedup {
            if let Some(dedup_id) = dedup_id {
                state.dedup.insert(dedup_id, now);
            }
        }

        Ok(())
    }

    async fn write_batch(&self, messages: Vec<NewMessage>) -> Result<()> {
        for message in messages {
            self.write(message).await?;
        }
        Ok(())
    }

    async fn read_and_capture(&self, worker_id: &str, read_batch_size: u32) -> Result<Vec<InboxMessage>> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        let limit = read_batch_size as usize;

        let mut eligible_indices: Vec<usize> = (0..state.pending.len())
            .filter(|&i| {
                let m = &state.pending[i];
                let lease_free = match m.captured_at {
                    None => true,
                    Some(captured_at) => self.lease_expired(captured_at, now),
                };
                lease_free
            })
            .collect();
        eligible_indices.sort_by_key(|&i| state.pending[i].received_at);

        let mut selected: Vec<usize> = Vec::new();
        let mut groups_acquired: Vec<String> = Vec::new();

        for idx in eligible_indices {
            if selected.len() >= limit {
                break;
            }
            if self.is_fifo {
                let group_id = match &state.pending[idx].group_id {
                    Some(g) => g.clone(),
                    None => {
                        selected.push(idx);
                        continue;
                    }
                };
                if self.group_locked_by_other(&state, &group_id, worker_id, now) {
                    continue;
                }
                selected.push(idx);
                if !groups_acquired.contains(&group_id) {
                    groups_acquired.push(group_id);
                }
            } else {
                selected.push(idx);
            }
        }

        for group_id in groups_acquired {
            state
                .group_locks
                .insert(group_id, GroupLockEntry { locked_at: now, locked_by: worker_id.to_string() });
        }

        let mut captured = Vec::with_capacity(selected.len());
        for idx in &selected {
            let message = &mut state.pending[*idx];
            message.captured_at = Some(now);
            message.captured_by = Some(worker_id.to_string());
            captured.push(message.clone());
        }

        Ok(captured)
    }

    async fn extend_locks(
        &self,
        worker_id: &str,
        message_ids: &[String],
        new_captured_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut extended = 0u64;
        let mut groups_to_refresh: Vec<String> = Vec::new();

        for message in state.pending.iter_mut() {
            if message_ids.iter().any(|id| id == &message.id)
                && message.captured_by.as_deref() == Some(worker_id)
                && message.captured_at.is_some()
            {
                message.captured_at = Some(new_captured_at);
                extended += 1;
                if let Some(group_id) = &message.group_id {
                    if !groups_to_refresh.contains(group_id) {
                        groups_to_refresh.push(group_id.clone());
                    }
                }
            }
        }

        for group_id in groups_to_refresh {
            if let Some(lock) = state.group_locks.get_mut(&group_id) {
                if lock.locked_by == worker_id {
                    lock.locked_at = new_captured_at;
                }
            }
        }

        Ok(extended)
    }

    async fn apply_results(&self, batch: ApplyResultsBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;

        for id in &batch.to_complete {
            state.pending.retain(|m| &m.id != id);
        }

        for id in &batch.to_fail {
            if let Some(message) = state.pending.iter_mut().find(|m| &m.id == id) {
                message.captured_at = None;
                message.captured_by = None;
                message.attempts_count += 1;
            }
        }

        for id in &batch.to_release {
            if let Some(message) = state.pending.iter_mut().find(|m| &m.id == id) {
                message.captured_at = None;
                message.captured_by = None;
            }
        }

        for entry in &batch.to_dead_letter {
            if let Some(pos) = state.pending.iter().position(|m| m.id == entry.id) {
                let message = state.pending.remove(pos);
                if self.enable_dead_letter {
                    state.dead_letters.push(DeadLetterMessage {
                        id: message.id,
                        inbox_name: message.inbox_name,
                        message_type: message.message_type,
                        payload: message.payload,
                        group_id: message.group_id,
                        attempts_count: message.attempts_count,
                        received_at: message.received_at,
                        failure_reason: entry.reason.clone(),
                        moved_at: now,
                    });
                }
            }
        }

        Ok(())
    }

    async fn read_dead_letters(&self, max: u32) -> Result<Vec<DeadLetterMessage>> {
        if !self.enable_dead_letter {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        let mut records: Vec<DeadLetterMessage> = state.dead_letters.clone();
        records.sort_by_key(|d| d.moved_at);
        records.truncate(max as usize);
        Ok(records)
    }

    async fn cleanup_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.dead_letters.len();
        state.dead_letters.retain(|d| d.moved_at > cutoff);
        Ok((before - state.dead_letters.len()) as u64)
    }

    async fn cleanup_dedup_records(&self, cutoff: DateTime<Utc>, _batch_size: u32) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.dedup.len();
        state.dedup.retain(|_, created_at| *created_at > cutoff);
        Ok((before - state.dedup.len()) as u64)
    }

    fn fifo_capability(&self) -> Option<&dyn FifoCapability> {
        if self.is_fifo {
            Some(self)
        } else {
            None
        }
    }

    fn maintenance_capability(&self) -> Option<&dyn MaintenanceCapability> {
        Some(self)
    }
}

#[async_trait]
impl FifoCapability for MemoryProvider {
    async fn release_group_locks(&self, group_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for group_id in group_ids {
            state.group_locks.remove(group_id);
        }
        Ok(())
    }

    async fn release_messages_and_group_locks(&self, message_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut group_ids: Vec<String> = Vec::new();
        for message in state.pending.iter_mut() {
            if message_ids.iter().any(|id| id == &message.id) {
                message.captured_at = None;
                message.captured_by = None;
                if let Some(group_id) = &message.group_id {
                    if !group_ids.contains(group_id) {
                        group_ids.push(group_id.clone());
                    }
                }
            }
        }
        for group_id in group_ids {
            state.group_locks.remove(&group_id);
        }
        Ok(())
    }

    async fn cleanup_expired_group_locks(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.group_locks.len();
        state.group_locks.retain(|_, lock| lock.locked_at > cutoff);
        Ok((before - state.group_locks.len()) as u64)
    }
}

#[async_trait]
impl MaintenanceCapability for MemoryProvider {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn health_metrics(&self) -> Result<HealthMetrics> {
        let state = self.state.lock().await;
        let pending_count = state.pending.iter().filter(|m| !m.is_captured()).count() as u64;
        let captured_count = state.pending.iter().filter(|m| m.is_captured()).count() as u64;
        let oldest_pending_at = state.pending.iter().filter(|m| !m.is_captured()).map(|m| m.received_at).min();
        Ok(HealthMetrics {
            pending_count,
            captured_count,
            dead_letter_count: state.dead_letters.len() as u64,
            oldest_pending_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::SystemClock;

    fn provider(is_fifo: bool) -> MemoryProvider {
        MemoryProvider::new(
            "orders",
            is_fifo,
            Duration::from_secs(30),
            true,
            Duration::from_secs(3600),
            true,
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn dedup_suppresses_second_write() {
        let provider = provider(false);
        provider
            .write(NewMessage::new("t", vec![]).with_deduplication_id("x"))
            .await
            .unwrap();
        provider
            .write(NewMessage::new("t", vec![]).with_deduplication_id("x"))
            .await
            .unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured.len(), 1);
    }

    #[tokio::test]
    async fn collapse_key_keeps_only_latest() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![]).with_collapse_key("k")).await.unwrap();
        provider.write(NewMessage::new("t", vec![]).with_collapse_key("k")).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured.len(), 1);
    }

    #[tokio::test]
    async fn fifo_group_lock_blocks_other_worker() {
        let provider = provider(true);
        provider.write(NewMessage::new("t", vec![]).with_group_id("g")).await.unwrap();
        provider.write(NewMessage::new("t", vec![]).with_group_id("g")).await.unwrap();

        let w1_batch = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(w1_batch.len(), 2);

        provider.write(NewMessage::new("t", vec![]).with_group_id("g")).await.unwrap();
        let w2_batch = provider.read_and_capture("w2", 10).await.unwrap();
        assert!(w2_batch.is_empty());
    }

    #[tokio::test]
    async fn apply_results_complete_removes_message() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![])).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        let mut batch = ApplyResultsBatch::default();
        batch.to_complete.push(captured[0].id.clone());
        provider.apply_results(batch).await.unwrap();
        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.captured_count, 0);
    }

    #[tokio::test]
    async fn lease_expiry_recovers_a_crashed_workers_message() {
        let clock = Arc::new(fc_common::FakeClock::new(Utc::now()));
        let provider = MemoryProvider::new(
            "orders",
            false,
            Duration::from_secs(5),
            false,
            Duration::from_secs(3600),
            true,
            clock.clone() as Arc<dyn fc_common::Clock>,
        );
        provider.write(NewMessage::new("t", vec![])).await.unwrap();
        let w1_batch = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(w1_batch[0].attempts_count, 0);

        clock.advance(chrono::Duration::seconds(6));
        let w2_batch = provider.read_and_capture("w2", 10).await.unwrap();

        assert_eq!(w2_batch.len(), 1);
        assert_eq!(w2_batch[0].captured_by.as_deref(), Some("w2"));
        assert_eq!(w2_batch[0].attempts_count, 0);
    }

    #[tokio::test]
    async fn dedup_record_expires_after_interval() {
        let clock = Arc::new(fc_common::FakeClock::new(Utc::now()));
        let provider = MemoryProvider::new(
            "orders",
            false,
            Duration::from_secs(30),
            true,
            Duration::from_secs(60),
            true,
            clock.clone() as Arc<dyn fc_common::Clock>,
        );
        provider.write(NewMessage::new("t", vec![]).with_deduplication_id("x")).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        provider.write(NewMessage::new("t", vec![]).with_deduplication_id("x")).await.unwrap();

        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured.len(), 2, "dedup window has elapsed, second write should persist");
    }

    #[tokio::test]
    async fn caller_supplied_id_is_idempotent_on_rewrite() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![]).with_id("order-1")).await.unwrap();
        provider.write(NewMessage::new("t", vec![]).with_id("order-1")).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured.len(), 1);
    }

    #[tokio::test]
    async fn apply_results_with_all_empty_inputs_is_a_noop() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![])).await.unwrap();
        provider.apply_results(ApplyResultsBatch::default()).await.unwrap();
        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 1);
    }

    #[tokio::test]
    async fn max_attempts_exceeded_moves_to_dead_letter() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![])).await.unwrap();

        // Two Failed classifications bring attempts_count to 2.
        for _ in 0..2 {
            let captured = provider.read_and_capture("w1", 10).await.unwrap();
            let mut batch = ApplyResultsBatch::default();
            batch.to_fail.push(captured[0].id.clone());
            provider.apply_results(batch).await.unwrap();
        }

        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured[0].attempts_count, 2);
        let message_id = captured[0].id.clone();

        // Third Failed, classified by the caller as exceeding MaxAttempts=3.
        let mut batch = ApplyResultsBatch::default();
        batch
            .to_dead_letter
            .push(crate::provider::DeadLetterEntry { id: message_id.clone(), reason: "Max attempts (3) exceeded".into() });
        provider.apply_results(batch).await.unwrap();

        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 0);
        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert_eq!(dead_letters[0].id, message_id);
        assert_eq!(dead_letters[0].attempts_count, 2, "attempts_count is unchanged on dead-letter");
    }

    #[tokio::test]
    async fn release_group_locks_on_unknown_group_is_a_noop() {
        let provider = provider(true);
        provider.release_group_locks(&["no-such-group".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn fifo_group_lock_released_after_release_messages_and_group_locks() {
        let provider = provider(true);
        provider.write(NewMessage::new("t", vec![]).with_group_id("g")).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        provider.release_messages_and_group_locks(&[captured[0].id.clone()]).await.unwrap();

        let w2_batch = provider.read_and_capture("w2", 10).await.unwrap();
        assert_eq!(w2_batch.len(), 1);
        assert_eq!(w2_batch[0].attempts_count, 0, "release leaves attempts unchanged");
    }

    #[tokio::test]
    async fn apply_results_dead_letter_records_reason() {
        let provider = provider(false);
        provider.write(NewMessage::new("t", vec![])).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        let mut batch = ApplyResultsBatch::default();
        batch.to_dead_letter.push(crate::provider::DeadLetterEntry {
            id: captured[0].id.clone(),
            reason: "Max attempts (3) exceeded".into(),
        });
        provider.apply_results(batch).await.unwrap();
        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert!(dead_letters[0].failure_reason.contains("Max attempts"));
    }
}

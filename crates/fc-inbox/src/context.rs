//! Per-poll-cycle processing context. Created for each captured
//! batch; strategies classify outcomes into it as handlers complete,
//! then the processing loop applies it exactly once via `apply`.

use std::sync::Mutex;

use tracing::debug;

use crate::error::Result;
use crate::model::{HandlerOutcome, InboxMessage};
use crate::provider::{ApplyResultsBatch, DeadLetterEntry, StorageProvider};

pub struct ProcessingContext {
    max_attempts: u32,
    batch: Mutex<ApplyResultsBatch>,
}

impl ProcessingContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            batch: Mutex::new(ApplyResultsBatch::default()),
        }
    }

    /// Classifies one message's outcome against `max_attempts` and
    /// buffers it into the appropriate result list.
    pub fn classify(&self, message: &InboxMessage, outcome: HandlerOutcome) {
        let mut batch = self.batch.lock().expect("processing context mutex poisoned");
        match outcome {
            HandlerOutcome::Success => {
                batch.to_complete.push(message.id.clone());
            }
            HandlerOutcome::Retry => {
                batch.to_release.push(message.id.clone());
            }
            HandlerOutcome::Failed { error } => {
                if message.attempts_count + 1 < self.max_attempts {
                    batch.to_fail.push(message.id.clone());
                } else {
                    let reason = format!(
                        "Max attempts ({}) exceeded{}",
                        self.max_attempts,
                        error.map(|e| format!(": {e}")).unwrap_or_default()
                    );
                    batch.to_dead_letter.push(DeadLetterEntry { id: message.id.clone(), reason });
                }
            }
            HandlerOutcome::MoveToDeadLetter { reason } => {
                let reason = reason.unwrap_or_else(|| "Moved to dead letter by handler".to_string());
                batch.to_dead_letter.push(DeadLetterEntry { id: message.id.clone(), reason });
            }
        }
    }

    /// Unknown message type, missing handler, or deserialization
    /// failure: straight to dead letter, never counted against attempts.
    pub fn dispatch_failure(&self, message_id: &str, reason: impl Into<String>) {
        let mut batch = self.batch.lock().expect("processing context mutex poisoned");
        batch.to_dead_letter.push(DeadLetterEntry { id: message_id.to_string(), reason: reason.into() });
    }

    /// The "handler threw" shortcut: every message in `messages` is
    /// routed through the same Failed-vs-max-attempts classification.
    pub fn fail_batch(&self, messages: &[InboxMessage], error: impl Into<String>) {
        let error = error.into();
        for message in messages {
            self.classify(message, HandlerOutcome::Failed { error: Some(error.clone()) });
        }
    }

    /// Applies the buffered batch exactly once. Empty input performs no
    /// I/O, per the storage contract. Takes `&self` (rather than
    /// consuming) so callers can hold the context behind an `Arc` while
    /// strategies classify into it from spawned tasks.
    pub async fn apply(&self, provider: &dyn StorageProvider) -> Result<()> {
        let batch = {
            let mut guard = self.batch.lock().expect("processing context mutex poisoned");
            std::mem::take(&mut *guard)
        };
        if batch.is_empty() {
            return Ok(());
        }
        debug!(
            to_complete = batch.to_complete.len(),
            to_fail = batch.to_fail.len(),
            to_release = batch.to_release.len(),
            to_dead_letter = batch.to_dead_letter.len(),
            "applying batch results"
        );
        provider.apply_results(batch).await
    }
}

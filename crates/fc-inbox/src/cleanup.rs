//! Dead-letter, dedup, and group-lock cleanup loops. Each is an
//! independently-run periodic task sharing one supervisor shape: on
//! uncaught error, log and restart after `restart_delay`; on
//! cancellation, exit cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fc_common::Clock;

use crate::config::InboxConfig;
use crate::provider::StorageProvider;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub check_interval: Duration,
    pub restart_delay: Duration,
    pub dedup_batch_size: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            restart_delay: Duration::from_secs(5),
            dedup_batch_size: 500,
        }
    }
}

/// Runs `body` on `cleanup_config.check_interval`, restarting after
/// `restart_delay` on error, until `shutdown` is cancelled.
async fn supervise<F, Fut>(
    name: &str,
    cleanup_config: &CleanupConfig,
    shutdown: &CancellationToken,
    mut body: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<u64>>,
{
    let mut ticker = tokio::time::interval(cleanup_config.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match body().await {
                    Ok(removed) if removed > 0 => info!(task = name, removed, "cleanup cycle removed records"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(task = name, error = %e, "cleanup cycle failed, restarting after delay");
                        tokio::select! {
                            _ = tokio::time::sleep(cleanup_config.restart_delay) => {}
                            _ = shutdown.cancelled() => break,
                        }
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Deletes dead-letter records older than `DeadLetterMaxMessageLifetime`.
/// Enabled only when dead letter is on and the lifetime is positive.
pub async fn run_dead_letter_cleanup(
    provider: Arc<dyn StorageProvider>,
    inbox_config: Arc<InboxConfig>,
    cleanup_config: CleanupConfig,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
) {
    if !inbox_config.enable_dead_letter || inbox_config.dead_letter_max_message_lifetime.is_zero() {
        return;
    }
    supervise("dead_letter_cleanup", &cleanup_config, &shutdown, || {
        let provider = Arc::clone(&provider);
        let lifetime = inbox_config.dead_letter_max_message_lifetime;
        let clock = Arc::clone(&clock);
        async move {
            let cutoff = clock.now_utc() - chrono::Duration::from_std(lifetime).unwrap_or_default();
            provider.cleanup_dead_letters(cutoff).await
        }
    })
    .await;
}

/// Deletes dedup records older than `DeduplicationInterval`. Durable
/// backends delete in batches of `dedup_batch_size` until exhausted per
/// cycle; volatile backends ignore the batch size and do a single pass.
pub async fn run_dedup_cleanup(
    provider: Arc<dyn StorageProvider>,
    inbox_config: Arc<InboxConfig>,
    cleanup_config: CleanupConfig,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
) {
    if !inbox_config.enable_deduplication || inbox_config.deduplication_interval.is_zero() {
        return;
    }
    supervise("dedup_cleanup", &cleanup_config, &shutdown, || {
        let provider = Arc::clone(&provider);
        let interval = inbox_config.deduplication_interval;
        let batch_size = cleanup_config.dedup_batch_size;
        let clock = Arc::clone(&clock);
        async move {
            let cutoff = clock.now_utc() - chrono::Duration::from_std(interval).unwrap_or_default();
            let mut total = 0u64;
            loop {
                let removed = provider.cleanup_dedup_records(cutoff, batch_size).await?;
                total += removed;
                if removed < batch_size as u64 {
                    break;
                }
            }
            Ok(total)
        }
    })
    .await;
}

/// Releases group locks where `LockedAt <= now - MaxProcessingTime`.
/// FIFO inboxes on durable backends only; a no-op for providers without
/// `FifoCapability` or for non-FIFO inboxes.
pub async fn run_group_lock_cleanup(
    provider: Arc<dyn StorageProvider>,
    inbox_config: Arc<InboxConfig>,
    cleanup_config: CleanupConfig,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
) {
    if !inbox_config.kind.is_fifo() {
        return;
    }
    let Some(_) = provider.fifo_capability() else { return };
    supervise("group_lock_cleanup", &cleanup_config, &shutdown, || {
        let provider = Arc::clone(&provider);
        let max_processing_time = inbox_config.max_processing_time;
        let clock = Arc::clone(&clock);
        async move {
            let cutoff = clock.now_utc() - chrono::Duration::from_std(max_processing_time).unwrap_or_default();
            match provider.fifo_capability() {
                Some(fifo) => fifo.cleanup_expired_group_locks(cutoff).await,
                None => Ok(0),
            }
        }
    })
    .await;
}

/// Runs all three cleanup tasks once (cronjob mode), returning the
/// total number of records removed across all three.
pub async fn run_once(
    provider: Arc<dyn StorageProvider>,
    inbox_config: &InboxConfig,
    clock: &Arc<dyn Clock>,
) -> crate::error::Result<u64> {
    let mut total = 0u64;

    if inbox_config.enable_dead_letter && !inbox_config.dead_letter_max_message_lifetime.is_zero() {
        let cutoff = clock.now_utc()
            - chrono::Duration::from_std(inbox_config.dead_letter_max_message_lifetime).unwrap_or_default();
        total += provider.cleanup_dead_letters(cutoff).await?;
    }

    if inbox_config.enable_deduplication && !inbox_config.deduplication_interval.is_zero() {
        let cutoff =
            clock.now_utc() - chrono::Duration::from_std(inbox_config.deduplication_interval).unwrap_or_default();
        total += provider.cleanup_dedup_records(cutoff, u32::MAX).await?;
    }

    if inbox_config.kind.is_fifo() {
        if let Some(fifo) = provider.fifo_capability() {
            let cutoff =
                clock.now_utc() - chrono::Duration::from_std(inbox_config.max_processing_time).unwrap_or_default();
            total += fifo.cleanup_expired_group_locks(cutoff).await?;
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fc_common::{Clock, FakeClock, SystemClock};

    use crate::config::InboxKind;
    use crate::memory::MemoryProvider;
    use crate::model::NewMessage;
    use crate::provider::{ApplyResultsBatch, DeadLetterEntry, StorageProvider};

    use super::*;

    fn config(kind: InboxKind) -> InboxConfig {
        let mut config = InboxConfig::new("orders", kind);
        config.dead_letter_max_message_lifetime = Duration::from_millis(10);
        config.deduplication_interval = Duration::from_millis(10);
        config.enable_deduplication = true;
        config
    }

    #[tokio::test]
    async fn run_once_removes_aged_dead_letters_and_dedup_records() {
        let fake = Arc::new(FakeClock::default());
        let clock: Arc<dyn Clock> = fake.clone();
        let provider: Arc<MemoryProvider> = Arc::new(MemoryProvider::new(
            "orders",
            false,
            Duration::from_secs(30),
            true,
            Duration::from_millis(10),
            true,
            Arc::clone(&clock),
        ));
        provider.write(NewMessage::new("t", vec![]).with_deduplication_id("d1")).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        let mut batch = ApplyResultsBatch::default();
        batch.to_dead_letter.push(DeadLetterEntry { id: captured[0].id.clone(), reason: "boom".into() });
        provider.apply_results(batch).await.unwrap();

        fake.advance(chrono::Duration::milliseconds(30));

        let removed =
            run_once(provider.clone() as Arc<dyn StorageProvider>, &config(InboxKind::Default), &clock).await.unwrap();
        assert_eq!(removed, 2);

        assert_eq!(provider.health_metrics().await.unwrap().dead_letter_count, 0);
    }

    #[tokio::test]
    async fn run_once_skips_disabled_cleanup_targets() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider: Arc<MemoryProvider> = Arc::new(MemoryProvider::new(
            "orders",
            false,
            Duration::from_secs(30),
            false,
            Duration::from_secs(3600),
            false,
            Arc::clone(&clock),
        ));
        let mut config = InboxConfig::new("orders", InboxKind::Default);
        config.enable_dead_letter = false;
        config.enable_deduplication = false;

        let removed = run_once(provider as Arc<dyn StorageProvider>, &config, &clock).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn run_once_releases_expired_group_locks_for_fifo_inboxes() {
        let fake = Arc::new(FakeClock::default());
        let clock: Arc<dyn Clock> = fake.clone();
        let provider: Arc<MemoryProvider> = Arc::new(MemoryProvider::new(
            "orders",
            true,
            Duration::from_millis(10),
            false,
            Duration::from_secs(3600),
            true,
            Arc::clone(&clock),
        ));
        provider.write(NewMessage::new("t", vec![]).with_group_id("g")).await.unwrap();
        provider.read_and_capture("w1", 10).await.unwrap();

        fake.advance(chrono::Duration::milliseconds(30));

        let mut config = InboxConfig::new("orders", InboxKind::Fifo);
        config.max_processing_time = Duration::from_millis(10);
        config.enable_dead_letter = false;
        let removed = run_once(provider.clone() as Arc<dyn StorageProvider>, &config, &clock).await.unwrap();
        assert_eq!(removed, 1);

        // The group lock is gone, so a second worker can now capture group g.
        let w2_batch = provider.read_and_capture("w2", 10).await.unwrap();
        assert_eq!(w2_batch.len(), 1);
    }
}

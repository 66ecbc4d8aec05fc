//! Lease extender: active only while a handler call is in
//! flight, refreshes the current batch's leases (and FIFO group locks,
//! inside `extend_locks`) on a fixed interval. Follows the supervisor
//! shape of a background recovery task elsewhere in this ecosystem,
//! scoped down to the lifetime of a single batch instead of running
//! forever.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use fc_common::Clock;

use crate::provider::StorageProvider;

pub struct LeaseExtenderHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl LeaseExtenderHandle {
    /// Stops the extender and waits for its current tick (if any) to
    /// finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

/// Starts a periodic extender for `message_ids`, owned by `worker_id`.
/// Fires every `interval` (`MaxProcessingTime *
/// LockExtensionThreshold`). Failures are logged and do not stop
/// processing — a repeatedly-failing extension simply lets the lease
/// expire, which is the documented safety fallback.
pub fn spawn(
    provider: Arc<dyn StorageProvider>,
    worker_id: String,
    message_ids: Vec<String>,
    interval: Duration,
    clock: Arc<dyn Clock>,
) -> LeaseExtenderHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        if message_ids.is_empty() || interval.is_zero() {
            let _ = stop_rx.await;
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; the batch has just started
        // so nothing needs extending yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = clock.now_utc();
                    match provider.extend_locks(&worker_id, &message_ids, now).await {
                        Ok(extended) => {
                            tracing::debug!(extended, worker_id = %worker_id, "extended leases");
                        }
                        Err(e) => {
                            warn!(worker_id = %worker_id, error = %e, "lease extension failed; lease may expire");
                        }
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
    });

    LeaseExtenderHandle { stop_tx: Some(stop_tx), join }
}

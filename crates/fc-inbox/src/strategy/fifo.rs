//! FIFO strategy: groups by `GroupId`; groups run in parallel up
//! to `MaxProcessingThreads`, but each group is processed strictly
//! sequentially, in storage (received-at) order. Releases the group
//! lock once the group's messages are fully processed, success or not.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::context::ProcessingContext;
use crate::model::InboxMessage;
use crate::provider::StorageProvider;
use crate::registry::HandlerRegistry;

use super::base::dispatch_one;

pub struct FifoStrategy;

impl FifoStrategy {
    pub async fn process(
        &self,
        messages: Vec<InboxMessage>,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ProcessingContext>,
        provider: Arc<dyn StorageProvider>,
        max_processing_time: Duration,
        max_processing_threads: usize,
    ) {
        let groups = super::base::group_by(messages, |m| m.group_id.clone().unwrap_or_default());
        let semaphore = Arc::new(Semaphore::new(max_processing_threads));
        let mut handles = Vec::with_capacity(groups.len());

        for (group_id, group) in groups {
            let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                // Messages arrive in storage (ReceivedAt) order; process
                // one at a time, never concurrently, within this group.
                for message in &group {
                    dispatch_one(message, &registry, &ctx, max_processing_time).await;
                }
                release_group_lock(&provider, &group_id).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Releases one group's lock. Non-FIFO providers (no `FifoCapability`)
/// have nothing to release here: they were never acquired in the first
/// place, since `read_and_capture` only takes group locks for FIFO
/// inboxes.
pub(super) async fn release_group_lock(provider: &Arc<dyn StorageProvider>, group_id: &str) {
    if group_id.is_empty() {
        return;
    }
    if let Some(fifo) = provider.fifo_capability() {
        if let Err(e) = fifo.release_group_locks(&[group_id.to_string()]).await {
            warn!(group_id, error = %e, "failed to release group lock; it will expire via MaxProcessingTime");
        }
    }
}

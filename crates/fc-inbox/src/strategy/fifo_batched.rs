//! FIFO-Batched strategy: groups by `GroupId`; within each group,
//! splits into maximal runs of consecutive same-`MessageType` messages
//! and dispatches each run as one batched-FIFO handler call. Runs within
//! a group execute sequentially; groups run in parallel up to
//! `MaxProcessingThreads`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::context::ProcessingContext;
use crate::model::{HandlerOutcome, InboxMessage};
use crate::provider::StorageProvider;
use crate::registry::{HandlerRegistry, HandlerVariant};

use super::base::{execute_with_timeout, group_by, raw_envelope, split_into_runs};
use super::fifo::release_group_lock;

pub struct FifoBatchedStrategy;

impl FifoBatchedStrategy {
    pub async fn process(
        &self,
        messages: Vec<InboxMessage>,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ProcessingContext>,
        provider: Arc<dyn StorageProvider>,
        max_processing_time: Duration,
        max_processing_threads: usize,
    ) {
        let groups = group_by(messages, |m| m.group_id.clone().unwrap_or_default());
        let semaphore = Arc::new(Semaphore::new(max_processing_threads));
        let mut handles = Vec::with_capacity(groups.len());

        for (group_id, group) in groups {
            let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                for run in split_into_runs(group) {
                    dispatch_run(&group_id, run, &registry, &ctx, max_processing_time).await;
                }
                release_group_lock(&provider, &group_id).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn dispatch_run(
    group_id: &str,
    run: Vec<InboxMessage>,
    registry: &HandlerRegistry,
    ctx: &ProcessingContext,
    max_processing_time: Duration,
) {
    let message_type = run[0].message_type.clone();
    let Some(HandlerVariant::FifoBatched(invoker)) = registry.lookup(&message_type) else {
        for message in &run {
            ctx.dispatch_failure(&message.id, format!("no FIFO-batched handler registered for {message_type:?}"));
        }
        return;
    };

    let by_id: std::collections::HashMap<&str, &InboxMessage> =
        run.iter().map(|m| (m.id.as_str(), m)).collect();
    let raws: Vec<_> = run.iter().map(raw_envelope).collect();

    match execute_with_timeout(max_processing_time, invoker(group_id.to_string(), raws)).await {
        Some(results) => {
            for (id, result) in results {
                let Some(message) = by_id.get(id.as_str()) else { continue };
                match result {
                    Ok(outcome) => ctx.classify(message, outcome),
                    Err(failure) => ctx.dispatch_failure(&message.id, failure.0),
                }
            }
        }
        None => {
            warn!(group_id, message_type, "FIFO-batched handler timed out");
            for message in &run {
                ctx.classify(message, HandlerOutcome::Failed { error: Some("handler timed out".into()) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use fc_common::SystemClock;
    use serde::Deserialize;

    use crate::context::ProcessingContext;
    use crate::memory::MemoryProvider;
    use crate::model::NewMessage;
    use crate::provider::StorageProvider;
    use crate::registry::{Envelope, FifoBatchedHandler, HandlerRegistry};

    use super::FifoBatchedStrategy;

    #[derive(Debug, Deserialize)]
    struct Event;

    /// Records each call's (group_id, run length), so tests can confirm
    /// same-type runs are batched and different runs dispatch separately.
    struct RecordingHandler(Arc<Mutex<Vec<(String, usize)>>>);

    #[async_trait]
    impl FifoBatchedHandler<Event> for RecordingHandler {
        async fn handle_batch(
            &self,
            group_id: String,
            envelopes: Vec<Envelope<Event>>,
        ) -> anyhow::Result<Vec<(String, crate::model::HandlerOutcome)>> {
            self.0.lock().unwrap().push((group_id, envelopes.len()));
            Ok(envelopes.into_iter().map(|e| (e.id, crate::model::HandlerOutcome::Success)).collect())
        }
    }

    fn provider() -> Arc<MemoryProvider> {
        Arc::new(MemoryProvider::new(
            "events",
            true,
            Duration::from_secs(30),
            false,
            Duration::from_secs(3600),
            true,
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn consecutive_same_type_run_dispatches_as_one_call() {
        let provider = provider();
        // a, a, a -> one run of 3 for group g.
        for _ in 0..3 {
            provider.write(NewMessage::new("event.a", b"{}".to_vec()).with_group_id("g")).await.unwrap();
        }
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register_fifo_batched("event.a", RecordingHandler(Arc::clone(&calls))).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        FifoBatchedStrategy
            .process(
                captured,
                registry,
                Arc::clone(&ctx),
                Arc::clone(&provider) as Arc<dyn StorageProvider>,
                Duration::from_secs(1),
                4,
            )
            .await;
        ctx.apply(provider.as_ref()).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec![("g".to_string(), 3)]);

        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 0);
    }

    #[tokio::test]
    async fn type_change_within_group_starts_a_new_run() {
        let provider = provider();
        provider.write(NewMessage::new("event.a", b"{}".to_vec()).with_group_id("g")).await.unwrap();
        provider.write(NewMessage::new("event.a", b"{}".to_vec()).with_group_id("g")).await.unwrap();
        provider.write(NewMessage::new("event.b", b"{}".to_vec()).with_group_id("g")).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let calls_a = Arc::new(Mutex::new(Vec::new()));
        let calls_b = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register_fifo_batched("event.a", RecordingHandler(Arc::clone(&calls_a))).unwrap();
        registry.register_fifo_batched("event.b", RecordingHandler(Arc::clone(&calls_b))).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        FifoBatchedStrategy
            .process(
                captured,
                registry,
                Arc::clone(&ctx),
                Arc::clone(&provider) as Arc<dyn StorageProvider>,
                Duration::from_secs(1),
                4,
            )
            .await;
        ctx.apply(provider.as_ref()).await.unwrap();

        assert_eq!(*calls_a.lock().unwrap(), vec![("g".to_string(), 2)]);
        assert_eq!(*calls_b.lock().unwrap(), vec![("g".to_string(), 1)]);
    }
}

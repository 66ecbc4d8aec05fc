//! Batched strategy: groups the captured batch by `MessageType`,
//! processes groups in parallel up to `MaxProcessingThreads`, dispatches
//! each group's messages to a single batched handler call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::context::ProcessingContext;
use crate::model::{HandlerOutcome, InboxMessage};
use crate::registry::{HandlerRegistry, HandlerVariant};

use super::base::{execute_with_timeout, group_by, raw_envelope};

pub struct BatchedStrategy;

impl BatchedStrategy {
    pub async fn process(
        &self,
        messages: Vec<InboxMessage>,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ProcessingContext>,
        max_processing_time: Duration,
        max_processing_threads: usize,
    ) {
        let groups = group_by(messages, |m| m.message_type.clone());
        let semaphore = Arc::new(Semaphore::new(max_processing_threads));
        let mut handles = Vec::with_capacity(groups.len());

        for (message_type, group) in groups {
            let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                dispatch_group(&message_type, group, &registry, &ctx, max_processing_time).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn dispatch_group(
    message_type: &str,
    group: Vec<InboxMessage>,
    registry: &HandlerRegistry,
    ctx: &ProcessingContext,
    max_processing_time: Duration,
) {
    let Some(HandlerVariant::Batched(invoker)) = registry.lookup(message_type) else {
        for message in &group {
            ctx.dispatch_failure(&message.id, format!("no batched handler registered for {message_type:?}"));
        }
        return;
    };

    let by_id: std::collections::HashMap<&str, &InboxMessage> =
        group.iter().map(|m| (m.id.as_str(), m)).collect();
    let raws: Vec<_> = group.iter().map(raw_envelope).collect();

    match execute_with_timeout(max_processing_time, invoker(raws)).await {
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
            warn!(message_type, "batched handler timed out");
            for message in &group {
                ctx.classify(message, HandlerOutcome::Failed { error: Some("handler timed out".into()) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use fc_common::SystemClock;
    use serde::Deserialize;

    use crate::context::ProcessingContext;
    use crate::memory::MemoryProvider;
    use crate::model::NewMessage;
    use crate::provider::StorageProvider;
    use crate::registry::{BatchedHandler, Envelope, HandlerRegistry};

    use super::BatchedStrategy;

    #[derive(Debug, Deserialize)]
    struct Item {
        #[allow(dead_code)]
        sku: String,
    }

    /// Succeeds every even-indexed envelope, fails the rest - exercises
    /// per-id outcome routing within one batched call.
    struct AlternatingHandler;

    #[async_trait]
    impl BatchedHandler<Item> for AlternatingHandler {
        async fn handle_batch(
            &self,
            envelopes: Vec<Envelope<Item>>,
        ) -> anyhow::Result<Vec<(String, crate::model::HandlerOutcome)>> {
            Ok(envelopes
                .into_iter()
                .enumerate()
                .map(|(i, e)| {
                    let outcome = if i % 2 == 0 {
                        crate::model::HandlerOutcome::Success
                    } else {
                        crate::model::HandlerOutcome::failed("odd index")
                    };
                    (e.id, outcome)
                })
                .collect())
        }
    }

    fn provider() -> MemoryProvider {
        MemoryProvider::new(
            "items",
            false,
            Duration::from_secs(30),
            false,
            Duration::from_secs(3600),
            true,
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn groups_by_type_and_routes_per_id_outcomes() {
        let provider = provider();
        for i in 0..4 {
            provider
                .write(NewMessage::new("item.restocked", format!(r#"{{"sku":"s{i}"}}"#).into_bytes()))
                .await
                .unwrap();
        }
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        assert_eq!(captured.len(), 4);

        let mut registry = HandlerRegistry::new();
        registry.register_batched("item.restocked", AlternatingHandler).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        BatchedStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        // Two succeeded (removed), two failed under max_attempts (released,
        // attempts incremented, still pending).
        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 2);
        assert_eq!(metrics.captured_count, 0);
    }

    #[tokio::test]
    async fn deserialization_failure_excluded_from_handler_call() {
        let provider = provider();
        provider.write(NewMessage::new("item.restocked", br#"{"sku":"ok"}"#.to_vec())).await.unwrap();
        provider.write(NewMessage::new("item.restocked", b"not json".to_vec())).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register_batched("item.restocked", AlternatingHandler).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        BatchedStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
    }

    #[tokio::test]
    async fn no_handler_registered_fails_every_message_in_group() {
        let provider = provider();
        provider.write(NewMessage::new("item.restocked", br#"{"sku":"x"}"#.to_vec())).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let registry = Arc::new(HandlerRegistry::new());
        let ctx = Arc::new(ProcessingContext::new(5));

        BatchedStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert!(dead_letters[0].failure_reason.contains("no batched handler"));
    }
}

//! Default strategy: per-message dispatch, parallel up to
//! `MaxProcessingThreads`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::context::ProcessingContext;
use crate::model::InboxMessage;
use crate::registry::HandlerRegistry;

use super::base::dispatch_one;

pub struct DefaultStrategy;

impl DefaultStrategy {
    pub async fn process(
        &self,
        messages: Vec<InboxMessage>,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ProcessingContext>,
        max_processing_time: Duration,
        max_processing_threads: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_processing_threads));
        let mut handles = Vec::with_capacity(messages.len());

        for message in messages {
            let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
            let registry = Arc::clone(&registry);
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                dispatch_one(&message, &registry, &ctx, max_processing_time).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
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
    use crate::model::{HandlerOutcome, NewMessage};
    use crate::provider::StorageProvider;
    use crate::registry::{DefaultHandler, Envelope, HandlerRegistry};

    use super::DefaultStrategy;

    #[derive(Debug, Deserialize)]
    struct Order {
        #[allow(dead_code)]
        sku: String,
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl DefaultHandler<Order> for AlwaysSucceeds {
        async fn handle(&self, _envelope: Envelope<Order>) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::Success)
        }
    }

    fn provider() -> MemoryProvider {
        MemoryProvider::new(
            "orders",
            false,
            Duration::from_secs(30),
            false,
            Duration::from_secs(3600),
            true,
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn successful_handler_completes_message() {
        let provider = provider();
        provider.write(NewMessage::new("order.created", br#"{"sku":"A1"}"#.to_vec())).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register_default("order.created", AlwaysSucceeds).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        DefaultStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.captured_count, 0);
        assert_eq!(metrics.dead_letter_count, 0);
    }

    #[tokio::test]
    async fn unregistered_type_goes_to_dead_letter_not_attempts() {
        let provider = provider();
        provider.write(NewMessage::new("unregistered.v9", br#"{}"#.to_vec())).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();
        let pre_attempts = captured[0].attempts_count;

        let registry = Arc::new(HandlerRegistry::new());
        let ctx = Arc::new(ProcessingContext::new(5));

        DefaultStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
        assert!(dead_letters[0].failure_reason.contains("unknown message type"));
        assert_eq!(dead_letters[0].attempts_count, pre_attempts);
    }

    #[tokio::test]
    async fn bad_payload_goes_to_dead_letter() {
        let provider = provider();
        provider.write(NewMessage::new("order.created", b"not json".to_vec())).await.unwrap();
        let captured = provider.read_and_capture("w1", 10).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register_default("order.created", AlwaysSucceeds).unwrap();
        let registry = Arc::new(registry);
        let ctx = Arc::new(ProcessingContext::new(5));

        DefaultStrategy.process(captured, registry, Arc::clone(&ctx), Duration::from_secs(1), 4).await;
        ctx.apply(&provider).await.unwrap();

        let dead_letters = provider.read_dead_letters(10).await.unwrap();
        assert_eq!(dead_letters.len(), 1);
    }
}

//! Per-inbox processing loop. One instance per inbox; the
//! orchestrator owns a named set of these. Follows a processor's
//! `start`/`poll_and_buffer` loop shape used elsewhere in this
//! ecosystem, generalized to the capture/strategy/apply cycle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fc_common::Clock;

use crate::config::InboxConfig;
use crate::context::ProcessingContext;
use crate::lease_extender;
use crate::provider::StorageProvider;
use crate::registry::HandlerRegistry;
use crate::strategy::Strategy;

/// `Stopped -> Starting -> Running -> Stopping -> Stopped`. Transitions
/// are one-way per cycle; `Running` loops back to itself each
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl From<u8> for LoopState {
    fn from(value: u8) -> Self {
        match value {
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

pub struct ProcessingLoop {
    worker_id: String,
    config: Arc<InboxConfig>,
    provider: Arc<dyn StorageProvider>,
    registry: Arc<HandlerRegistry>,
    strategy: Strategy,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    // Serializes concurrent `run` calls for the same loop instance; a
    // loop is meant to have exactly one runner, this just prevents
    // accidental double-starts from racing on `state`.
    run_guard: Mutex<()>,
}

impl ProcessingLoop {
    pub fn new(
        worker_id: impl Into<String>,
        config: Arc<InboxConfig>,
        provider: Arc<dyn StorageProvider>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let strategy = Strategy::for_kind(config.kind);
        Self {
            worker_id: worker_id.into(),
            config,
            provider,
            registry,
            strategy,
            clock,
            state: AtomicU8::new(LoopState::Stopped as u8),
            run_guard: Mutex::new(()),
        }
    }

    pub fn state(&self) -> LoopState {
        LoopState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn inbox_name(&self) -> &str {
        &self.config.inbox_name
    }

    /// Runs until `shutdown` is cancelled. Errors from any step are
    /// logged; the loop continues to the next iteration. Exits only on
    /// cancellation.
    pub async fn run(&self, shutdown: CancellationToken) {
        let _guard = self.run_guard.lock().await;
        self.set_state(LoopState::Starting);
        info!(inbox = self.inbox_name(), worker_id = %self.worker_id, "processing loop starting");
        self.set_state(LoopState::Running);

        while !shutdown.is_cancelled() {
            if let Err(e) = self.iterate(&shutdown).await {
                error!(inbox = self.inbox_name(), error = %e, "processing loop iteration failed");
            }
        }

        self.set_state(LoopState::Stopping);
        info!(inbox = self.inbox_name(), "processing loop stopping");
        self.set_state(LoopState::Stopped);
    }

    async fn iterate(&self, shutdown: &CancellationToken) -> crate::error::Result<()> {
        let captured = tokio::select! {
            result = self.provider.read_and_capture(&self.worker_id, self.config.read_batch_size) => result?,
            _ = shutdown.cancelled() => return Ok(()),
        };

        if captured.is_empty() {
            sleep_interruptible(self.config.polling_interval, shutdown).await;
            return Ok(());
        }

        debug!(inbox = self.inbox_name(), count = captured.len(), "captured batch");

        let message_ids: Vec<String> = captured.iter().map(|m| m.id.clone()).collect();
        let ctx = Arc::new(ProcessingContext::new(self.config.max_attempts));

        let extender = if self.config.enable_lock_extension {
            Some(lease_extender::spawn(
                Arc::clone(&self.provider),
                self.worker_id.clone(),
                message_ids,
                self.config.lock_extension_interval(),
                Arc::clone(&self.clock),
            ))
        } else {
            None
        };

        self.strategy
            .process(
                captured,
                Arc::clone(&self.registry),
                Arc::clone(&ctx),
                Arc::clone(&self.provider),
                self.config.max_processing_time,
                self.config.max_processing_threads,
            )
            .await;

        if let Some(extender) = extender {
            extender.stop().await;
        }

        ctx.apply(self.provider.as_ref()).await?;

        if !self.config.read_delay.is_zero() {
            sleep_interruptible(self.config.read_delay, shutdown).await;
        }

        Ok(())
    }
}

async fn sleep_interruptible(duration: std::time::Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use fc_common::SystemClock;

    use crate::config::InboxKind;
    use crate::memory::MemoryProvider;
    use crate::model::{HandlerOutcome, NewMessage};
    use crate::provider::StorageProvider;
    use crate::registry::{DefaultHandler, Envelope, HandlerRegistry};

    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl DefaultHandler<serde_json::Value> for AlwaysSucceeds {
        async fn handle(&self, _envelope: Envelope<serde_json::Value>) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::Success)
        }
    }

    fn make_loop(registry: HandlerRegistry) -> (ProcessingLoop, Arc<MemoryProvider>) {
        let config = Arc::new(InboxConfig::new("orders", InboxKind::Default).validate().unwrap());
        let provider = Arc::new(MemoryProvider::new(
            "orders",
            false,
            config.max_processing_time,
            config.enable_deduplication,
            config.deduplication_interval,
            config.enable_dead_letter,
            Arc::new(SystemClock),
        ));
        let processing_loop = ProcessingLoop::new(
            "w1",
            Arc::clone(&config),
            Arc::clone(&provider) as Arc<dyn StorageProvider>,
            Arc::new(registry),
            Arc::new(SystemClock),
        );
        (processing_loop, provider)
    }

    #[tokio::test]
    async fn one_iteration_captures_dispatches_and_applies() {
        let mut registry = HandlerRegistry::new();
        registry.register_default("order.created", AlwaysSucceeds).unwrap();
        let (processing_loop, provider) = make_loop(registry);

        provider.write(NewMessage::new("order.created", b"{}".to_vec())).await.unwrap();

        let shutdown = CancellationToken::new();
        processing_loop.iterate(&shutdown).await.unwrap();

        let metrics = provider.health_metrics().await.unwrap();
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.captured_count, 0);
    }

    #[tokio::test]
    async fn empty_capture_sleeps_then_returns_without_error() {
        let (processing_loop, _provider) = make_loop(HandlerRegistry::new());
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // polling_interval sleep is interruptible; an already-cancelled
        // token should let iterate return immediately instead of blocking
        // for the full polling interval.
        let result = tokio::time::timeout(Duration::from_millis(200), processing_loop.iterate(&shutdown)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_transitions_through_states_and_stops_on_cancellation() {
        let (processing_loop, _provider) = make_loop(HandlerRegistry::new());
        assert_eq!(processing_loop.state(), LoopState::Stopped);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // Already cancelled: the loop body never executes an iteration,
        // but the state machine still walks Stopped -> ... -> Stopped.
        processing_loop.run(shutdown).await;
        assert_eq!(processing_loop.state(), LoopState::Stopped);
    }
}

//! Lifecycle orchestrator: starts/stops the per-inbox processing
//! loops and their cleanup tasks as one group. Follows the
//! start/stop-with-shutdown-broadcast wiring pattern this ecosystem's
//! processor binaries use, generalized from one processor to a named
//! set of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use fc_common::{Clock, SystemClock};

use crate::cleanup::{self, CleanupConfig};
use crate::config::InboxConfig;
use crate::processing_loop::{LoopState, ProcessingLoop};
use crate::provider::StorageProvider;
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct InboxStatus {
    pub inbox_name: String,
    pub state: LoopState,
}

struct Registration {
    processing_loop: Arc<ProcessingLoop>,
    provider: Arc<dyn StorageProvider>,
    config: Arc<InboxConfig>,
}

pub struct Orchestrator {
    worker_id: String,
    cleanup_config: CleanupConfig,
    shutdown_timeout: std::time::Duration,
    clock: Arc<dyn Clock>,
    registrations: HashMap<String, Registration>,
    shutdown: CancellationToken,
    running: AtomicBool,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(worker_id: impl Into<String>, shutdown_timeout: std::time::Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            cleanup_config: CleanupConfig::default(),
            shutdown_timeout,
            clock: Arc::new(SystemClock),
            registrations: HashMap::new(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_cleanup_config(mut self, cleanup_config: CleanupConfig) -> Self {
        self.cleanup_config = cleanup_config;
        self
    }

    /// Overrides the clock used for every expiry computation (lease
    /// extension, dead-letter/dedup/group-lock cleanup) across all
    /// inboxes registered on this orchestrator. Tests inject a
    /// `FakeClock` here instead of waiting on real time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_inbox(
        &mut self,
        config: InboxConfig,
        provider: Arc<dyn StorageProvider>,
        registry: HandlerRegistry,
    ) {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let processing_loop = Arc::new(ProcessingLoop::new(
            self.worker_id.clone(),
            Arc::clone(&config),
            Arc::clone(&provider),
            registry,
            Arc::clone(&self.clock),
        ));
        self.registrations.insert(
            config.inbox_name.clone(),
            Registration { processing_loop, provider, config },
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn get_inbox(&self, name: &str) -> Option<InboxStatus> {
        self.registrations
            .get(name)
            .map(|r| InboxStatus { inbox_name: name.to_string(), state: r.processing_loop.state() })
    }

    /// Spawns every registered inbox's processing loop plus its three
    /// cleanup tasks.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(inboxes = self.registrations.len(), "orchestrator starting");

        let mut handles = self.handles.lock().await;
        for registration in self.registrations.values() {
            let processing_loop = Arc::clone(&registration.processing_loop);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                processing_loop.run(shutdown).await;
            }));

            {
                let provider = Arc::clone(&registration.provider);
                let config = Arc::clone(&registration.config);
                let cleanup_config = self.cleanup_config.clone();
                let shutdown = self.shutdown.clone();
                let clock = Arc::clone(&self.clock);
                handles.push(tokio::spawn(cleanup::run_dead_letter_cleanup(provider, config, cleanup_config, shutdown, clock)));
            }
            {
                let provider = Arc::clone(&registration.provider);
                let config = Arc::clone(&registration.config);
                let cleanup_config = self.cleanup_config.clone();
                let shutdown = self.shutdown.clone();
                let clock = Arc::clone(&self.clock);
                handles.push(tokio::spawn(cleanup::run_dedup_cleanup(provider, config, cleanup_config, shutdown, clock)));
            }
            {
                let provider = Arc::clone(&registration.provider);
                let config = Arc::clone(&registration.config);
                let cleanup_config = self.cleanup_config.clone();
                let shutdown = self.shutdown.clone();
                let clock = Arc::clone(&self.clock);
                handles.push(tokio::spawn(cleanup::run_group_lock_cleanup(provider, config, cleanup_config, shutdown, clock)));
            }
        }
    }

    /// Cancels the shared shutdown token and joins every spawned task
    /// up to `shutdown_timeout`. Tasks still running after that are
    /// abandoned; their in-flight messages are recovered by lease
    /// expiry on the next capture.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let mut handles = self.handles.lock().await;
        let joined = tokio::time::timeout(self.shutdown_timeout, async {
            for handle in handles.drain(..) {
                let _ = handle.await;
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!("orchestrator shutdown timed out; remaining tasks abandoned");
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use fc_common::SystemClock;

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

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_idempotent() {
        let mut config = InboxConfig::new("orders", crate::config::InboxKind::Default).validate().unwrap();
        config.polling_interval = Duration::from_millis(10);
        let provider: Arc<dyn StorageProvider> = Arc::new(MemoryProvider::new(
            "orders",
            false,
            config.max_processing_time,
            config.enable_deduplication,
            config.deduplication_interval,
            config.enable_dead_letter,
            Arc::new(SystemClock),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register_default("order.created", AlwaysSucceeds).unwrap();

        let mut orchestrator = Orchestrator::new("w1", Duration::from_millis(200));
        orchestrator.register_inbox(config, provider, registry);

        assert!(!orchestrator.is_running());
        orchestrator.start().await;
        orchestrator.start().await; // second call is a no-op
        assert!(orchestrator.is_running());

        let status = orchestrator.get_inbox("orders").expect("registered");
        assert_eq!(status.inbox_name, "orders");

        orchestrator.stop().await;
        orchestrator.stop().await; // second call is a no-op
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn messages_written_before_start_are_eventually_processed() {
        let mut config = InboxConfig::new("orders", crate::config::InboxKind::Default).validate().unwrap();
        config.polling_interval = Duration::from_millis(5);
        let provider: Arc<MemoryProvider> = Arc::new(MemoryProvider::new(
            "orders",
            false,
            config.max_processing_time,
            config.enable_deduplication,
            config.deduplication_interval,
            config.enable_dead_letter,
            Arc::new(SystemClock),
        ));
        provider.write(NewMessage::new("order.created", b"{}".to_vec())).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register_default("order.created", AlwaysSucceeds).unwrap();

        let mut orchestrator = Orchestrator::new("w1", Duration::from_millis(200));
        orchestrator.register_inbox(config, provider.clone() as Arc<dyn StorageProvider>, registry);
        orchestrator.start().await;

        let mut remaining = provider.health_metrics().await.unwrap().pending_count
            + provider.health_metrics().await.unwrap().captured_count;
        for _ in 0..50 {
            let metrics = provider.health_metrics().await.unwrap();
            remaining = metrics.pending_count + metrics.captured_count;
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orchestrator.stop().await;

        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn unknown_inbox_has_no_status() {
        let orchestrator = Orchestrator::new("w1", Duration::from_millis(200));
        assert!(orchestrator.get_inbox("missing").is_none());
    }
}

//! Inbox worker
//!
//! A minimal binary wiring one storage backend, a demo handler, and the
//! orchestrator together, with signal-based graceful shutdown. Grounded
//! on the outbox processor binary's shape: env-driven configuration,
//! a backend-selection match, ctrl-c/SIGTERM shutdown.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FC_INBOX_NAME` | `demo` | Inbox name |
//! | `FC_INBOX_KIND` | `default` | `default`, `batched`, `fifo`, `fifo-batched` |
//! | `FC_INBOX_DB_TYPE` | `memory` | `memory`, `sqlite`, `postgres`, `redis` |
//! | `FC_INBOX_DB_URL` | - | Connection URL (required for sqlite/postgres/redis) |
//! | `FC_INBOX_READ_BATCH_SIZE` | `100` | Messages captured per poll |
//! | `FC_INBOX_POLL_INTERVAL_MS` | `1000` | Poll interval |
//! | `FC_INBOX_MAX_PROCESSING_TIME_SECS` | `30` | Lease duration |
//! | `FC_INBOX_MAX_ATTEMPTS` | `5` | Attempts before dead-letter |
//! | `FC_INBOX_ENABLE_DEDUP` | `false` | Enable deduplication-id suppression |
//! | `FC_INBOX_DEDUP_INTERVAL_SECS` | `3600` | Dedup record freshness window |
//! | `FC_INBOX_SHUTDOWN_TIMEOUT_SECS` | `30` | Graceful shutdown budget |
//! | `FC_WORKER_ID` | hostname or random | This worker's identity |
//! | `RUST_LOG` | `info` | Log level |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::info;

use fc_common::SystemClock;
use fc_inbox::{
    DefaultHandler, Envelope, FifoHandler, HandlerOutcome, HandlerRegistry, InboxConfig, InboxKind, MemoryProvider,
    Orchestrator, StorageProvider,
};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

/// Demo handler: logs the envelope and succeeds. Stands in for a real
/// business handler so the binary has something to dispatch to out of
/// the box.
struct EchoHandler;

async fn echo(envelope: Envelope<serde_json::Value>) -> anyhow::Result<HandlerOutcome> {
    info!(
        id = %envelope.id,
        message_type = %envelope.message_type,
        attempts = envelope.attempts_count,
        body = %envelope.body,
        "dispatching demo message"
    );
    Ok(HandlerOutcome::Success)
}

#[async_trait]
impl DefaultHandler<serde_json::Value> for EchoHandler {
    async fn handle(&self, envelope: Envelope<serde_json::Value>) -> anyhow::Result<HandlerOutcome> {
        echo(envelope).await
    }
}

#[async_trait]
impl FifoHandler<serde_json::Value> for EchoHandler {
    async fn handle(&self, envelope: Envelope<serde_json::Value>) -> anyhow::Result<HandlerOutcome> {
        echo(envelope).await
    }
}

fn parse_kind(raw: &str) -> Result<InboxKind> {
    match raw {
        "default" => Ok(InboxKind::Default),
        "batched" => Ok(InboxKind::Batched),
        "fifo" => Ok(InboxKind::Fifo),
        "fifo-batched" | "fifo_batched" => Ok(InboxKind::FifoBatched),
        other => Err(anyhow::anyhow!("unknown FC_INBOX_KIND {:?}; use default, batched, fifo, or fifo-batched", other)),
    }
}

async fn build_provider(db_type: &str, config: &InboxConfig) -> Result<Arc<dyn StorageProvider>> {
    let clock = Arc::new(SystemClock);
    let is_fifo = config.kind.is_fifo();

    match db_type {
        "memory" => Ok(Arc::new(MemoryProvider::new(
            config.inbox_name.clone(),
            is_fifo,
            config.max_processing_time,
            config.enable_deduplication,
            config.deduplication_interval,
            config.enable_dead_letter,
            clock,
        ))),
        "sqlite" => {
            let url = env_required("FC_INBOX_DB_URL")?;
            let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
            let provider = fc_inbox::SqliteProvider::new(
                pool,
                config.inbox_name.clone(),
                is_fifo,
                config.max_processing_time,
                config.enable_deduplication,
                config.deduplication_interval,
                config.enable_dead_letter,
                clock,
            );
            provider.init_schema().await?;
            info!("using SQLite inbox storage: {}", url);
            Ok(Arc::new(provider))
        }
        "postgres" => {
            let url = env_required("FC_INBOX_DB_URL")?;
            let pool = sqlx::postgres::PgPoolOptions::new().max_connections(10).connect(&url).await?;
            let provider = fc_inbox::PostgresProvider::new(
                pool,
                config.inbox_name.clone(),
                is_fifo,
                config.max_processing_time,
                config.enable_deduplication,
                config.deduplication_interval,
                config.enable_dead_letter,
                clock,
            );
            provider.init_schema().await?;
            info!("using PostgreSQL inbox storage");
            Ok(Arc::new(provider))
        }
        "redis" => {
            let url = env_required("FC_INBOX_DB_URL")?;
            let provider = fc_inbox::RedisProvider::connect(
                &url,
                config.inbox_name.clone(),
                is_fifo,
                config.max_processing_time,
                config.enable_deduplication,
                config.deduplication_interval,
                config.enable_dead_letter,
                clock,
            )
            .await?;
            info!("using Redis inbox storage");
            Ok(Arc::new(provider))
        }
        other => Err(anyhow::anyhow!("unknown FC_INBOX_DB_TYPE {:?}; use memory, sqlite, postgres, or redis", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fc_common::logging::init_logging("fc-inbox-worker");

    let inbox_name = env_or("FC_INBOX_NAME", "demo");
    let kind = parse_kind(&env_or("FC_INBOX_KIND", "default"))?;
    let db_type = env_or("FC_INBOX_DB_TYPE", "memory");
    let worker_id = env_or("FC_WORKER_ID", &format!("worker-{}", uuid::Uuid::new_v4()));
    let shutdown_timeout = Duration::from_secs(env_or_parse("FC_INBOX_SHUTDOWN_TIMEOUT_SECS", 30));

    info!(inbox = %inbox_name, kind = ?kind, db = %db_type, worker = %worker_id, "starting inbox worker");

    let mut config = InboxConfig::new(inbox_name.clone(), kind);
    config.read_batch_size = env_or_parse("FC_INBOX_READ_BATCH_SIZE", config.read_batch_size);
    config.polling_interval = Duration::from_millis(env_or_parse("FC_INBOX_POLL_INTERVAL_MS", 1000));
    config.max_processing_time = Duration::from_secs(env_or_parse("FC_INBOX_MAX_PROCESSING_TIME_SECS", 30));
    config.max_attempts = env_or_parse("FC_INBOX_MAX_ATTEMPTS", config.max_attempts);
    config.enable_deduplication = env_or_parse("FC_INBOX_ENABLE_DEDUP", false);
    config.deduplication_interval = Duration::from_secs(env_or_parse("FC_INBOX_DEDUP_INTERVAL_SECS", 3600));
    config.shutdown_timeout = shutdown_timeout;
    let config = config.validate()?;

    let provider = build_provider(&db_type, &config).await?;

    let mut registry = HandlerRegistry::new();
    match config.kind {
        InboxKind::Default => registry.register_default("demo.echo", EchoHandler)?,
        InboxKind::Fifo => registry.register_fifo("demo.echo", EchoHandler)?,
        InboxKind::Batched | InboxKind::FifoBatched => {
            return Err(anyhow::anyhow!(
                "this demo binary wires the EchoHandler as a Default/Fifo handler; batched kinds need a batch-shaped handler"
            ));
        }
    }

    let mut orchestrator = Orchestrator::new(worker_id, shutdown_timeout);
    orchestrator.register_inbox(config, provider, registry);
    orchestrator.start().await;

    info!("inbox worker started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");

    orchestrator.stop().await;
    info!("inbox worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

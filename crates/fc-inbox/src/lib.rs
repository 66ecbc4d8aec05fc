//! FlowCatalyst Inbox
//!
//! A transactional inbox: the consumption-side dual of the outbox
//! pattern. Durably captures inbound messages, leases them to a worker
//! for processing,
//! and guarantees at-least-once delivery to handlers with dedup on
//! write and a dead-letter queue for exhausted retries.
//!
//! # Features
//!
//! - **Four dispatch strategies**: per-message (`Default`), grouped by
//!   type (`Batched`), strictly ordered per group (`Fifo`), and grouped
//!   runs within an ordered group (`FifoBatched`).
//! - **Pluggable storage**: SQLite, Postgres, Redis, or in-memory,
//!   behind one `StorageProvider` contract.
//! - **Lease-based capture**: no separate lock table for non-FIFO
//!   inboxes; FIFO inboxes add group locks.
//!
//! # Example
//!
//! ```no_run
//! use fc_inbox::{HandlerRegistry, InboxConfig, InboxKind, MemoryProvider, Orchestrator};
//! use fc_common::SystemClock;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn example() {
//!     let config = InboxConfig::new("orders", InboxKind::Default).validate().unwrap();
//!     let provider = Arc::new(MemoryProvider::new(
//!         "orders",
//!         false,
//!         config.max_processing_time,
//!         config.enable_deduplication,
//!         config.deduplication_interval,
//!         config.enable_dead_letter,
//!         Arc::new(SystemClock),
//!     ));
//!
//!     let registry = HandlerRegistry::new();
//!     let mut orchestrator = Orchestrator::new("worker-1", Duration::from_secs(30));
//!     orchestrator.register_inbox(config, provider, registry);
//!     orchestrator.start().await;
//! }
//! ```

mod cleanup;
mod config;
mod context;
mod error;
mod lease_extender;
mod memory;
mod model;
mod orchestrator;
mod processing_loop;
mod provider;
mod registry;
mod retry;
mod strategy;
mod writer;

#[cfg(feature = "sqlite")]
mod sqlite;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis-backend")]
mod redis_provider;

pub use cleanup::CleanupConfig;
pub use config::{InboxConfig, InboxKind, RetryPolicy};
pub use context::ProcessingContext;
pub use error::{InboxError, Result};
pub use memory::MemoryProvider;
pub use model::{
    DeadLetterMessage, DeduplicationRecord, GroupLock, HandlerOutcome, HealthMetrics, InboxMessage, NewMessage,
};
pub use orchestrator::{InboxStatus, Orchestrator};
pub use processing_loop::{LoopState, ProcessingLoop};
pub use provider::{ApplyResultsBatch, DeadLetterEntry, FifoCapability, MaintenanceCapability, StorageProvider};
pub use registry::{
    BatchedHandler, DefaultHandler, Envelope, FifoBatchedHandler, FifoHandler, HandlerRegistry, HandlerVariant,
    RawEnvelope, MAX_REGISTERED_HANDLERS,
};
pub use writer::InboxWriter;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProvider;

#[cfg(feature = "postgres")]
pub use postgres::PostgresProvider;

#[cfg(feature = "redis-backend")]
pub use redis_provider::RedisProvider;

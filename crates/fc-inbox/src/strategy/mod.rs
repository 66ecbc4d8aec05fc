//! The four processing strategies, unified behind one enum the
//! processing loop dispatches through based on the inbox's `InboxKind`.

mod base;
mod batched;
mod default;
mod fifo;
mod fifo_batched;

pub use base::{execute_with_timeout, group_by, split_into_runs};
pub use batched::BatchedStrategy;
pub use default::DefaultStrategy;
pub use fifo::FifoStrategy;
pub use fifo_batched::FifoBatchedStrategy;

use std::sync::Arc;
use std::time::Duration;

use crate::config::InboxKind;
use crate::context::ProcessingContext;
use crate::model::InboxMessage;
use crate::provider::StorageProvider;
use crate::registry::HandlerRegistry;

pub enum Strategy {
    Default(DefaultStrategy),
    Batched(BatchedStrategy),
    Fifo(FifoStrategy),
    FifoBatched(FifoBatchedStrategy),
}

impl Strategy {
    pub fn for_kind(kind: InboxKind) -> Self {
        match kind {
            InboxKind::Default => Strategy::Default(DefaultStrategy),
            InboxKind::Batched => Strategy::Batched(BatchedStrategy),
            InboxKind::Fifo => Strategy::Fifo(FifoStrategy),
            InboxKind::FifoBatched => Strategy::FifoBatched(FifoBatchedStrategy),
        }
    }

    pub async fn process(
        &self,
        messages: Vec<InboxMessage>,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ProcessingContext>,
        provider: Arc<dyn StorageProvider>,
        max_processing_time: Duration,
        max_processing_threads: usize,
    ) {
        match self {
            Strategy::Default(s) => {
                s.process(messages, registry, ctx, max_processing_time, max_processing_threads).await
            }
            Strategy::Batched(s) => {
                s.process(messages, registry, ctx, max_processing_time, max_processing_threads).await
            }
            Strategy::Fifo(s) => {
                s.process(messages, registry, ctx, provider, max_processing_time, max_processing_threads).await
            }
            Strategy::FifoBatched(s) => {
                s.process(messages, registry, ctx, provider, max_processing_time, max_processing_threads).await
            }
        }
    }
}

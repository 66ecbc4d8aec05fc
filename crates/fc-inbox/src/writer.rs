//! Producer API: `write`/`write_batch`, routed to the storage
//! provider for the named inbox. `MaxWriteThreads` bounds the number of
//! concurrent writes in flight per inbox, mirroring the
//! semaphore-bounded concurrency used for the process pool elsewhere in
//! this ecosystem.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{InboxError, Result};
use crate::model::NewMessage;
use crate::provider::StorageProvider;

struct InboxRoute {
    provider: Arc<dyn StorageProvider>,
    write_semaphore: Arc<Semaphore>,
}

/// A multi-inbox producer-facing writer. Honors dedup and collapse (the
/// storage provider enforces both; the writer only routes and bounds
/// concurrency).
#[derive(Default)]
pub struct InboxWriter {
    routes: HashMap<String, InboxRoute>,
}

impl InboxWriter {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    pub fn register(&mut self, inbox_name: impl Into<String>, provider: Arc<dyn StorageProvider>, max_write_threads: usize) {
        self.routes.insert(
            inbox_name.into(),
            InboxRoute { provider, write_semaphore: Arc::new(Semaphore::new(max_write_threads.max(1))) },
        );
    }

    fn route(&self, inbox_name: &str) -> Result<&InboxRoute> {
        self.routes
            .get(inbox_name)
            .ok_or_else(|| InboxError::Config(format!("no inbox registered named {inbox_name:?}")))
    }

    pub async fn write(&self, inbox_name: &str, message: NewMessage) -> Result<()> {
        let route = self.route(inbox_name)?;
        let _permit = route.write_semaphore.acquire().await.expect("semaphore not closed");
        route.provider.write(message).await
    }

    pub async fn write_batch(&self, inbox_name: &str, messages: Vec<NewMessage>) -> Result<()> {
        let route = self.route(inbox_name)?;
        let _permit = route.write_semaphore.acquire().await.expect("semaphore not closed");
        route.provider.write_batch(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_to_unregistered_inbox_errors() {
        let writer = InboxWriter::new();
        let result = writer.write("missing", NewMessage::new("t", vec![])).await;
        assert!(result.is_err());
    }
}

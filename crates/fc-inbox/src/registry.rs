//! Handler registry: polymorphism over the four handler shapes,
//! implemented as a registry. `MessageType` maps to a dispatch
//! descriptor `{decoder, handlerVariant, invoker}` — here the decoder
//! and invoker are fused into one closure closed over the concrete
//! message type `T`, stored behind a `HandlerVariant`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::{InboxError, Result};
use crate::model::HandlerOutcome;

/// Upper bound on distinct registered message types. Registration
/// happens once at startup before any processing loop runs, so this
/// cannot be hit by runtime growth in normal operation — it exists to
/// catch a registration bug (e.g. a loop re-registering per message)
/// cheaply rather than letting the map grow without bound. Expected
/// handler-type cardinality for a single inbox process is in the tens.
pub const MAX_REGISTERED_HANDLERS: usize = 256;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message as handed to a handler, after successful deserialization.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub id: String,
    pub message_type: String,
    pub group_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub body: T,
}

/// The raw, not-yet-decoded form a strategy hands to the registry.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    pub id: String,
    pub message_type: String,
    pub group_id: Option<String>,
    pub attempts_count: u32,
    pub received_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Deserialization failed for this message: goes straight to dead
/// letter, not counted against attempts.
#[derive(Debug, Clone)]
pub struct DispatchFailure(pub String);

pub type InvokeResult = std::result::Result<HandlerOutcome, DispatchFailure>;

#[async_trait]
pub trait DefaultHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, envelope: Envelope<T>) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
pub trait BatchedHandler<T: Send + 'static>: Send + Sync {
    async fn handle_batch(&self, envelopes: Vec<Envelope<T>>) -> anyhow::Result<Vec<(String, HandlerOutcome)>>;
}

#[async_trait]
pub trait FifoHandler<T: Send + 'static>: Send + Sync {
    async fn handle(&self, envelope: Envelope<T>) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
pub trait FifoBatchedHandler<T: Send + 'static>: Send + Sync {
    async fn handle_batch(
        &self,
        group_id: String,
        envelopes: Vec<Envelope<T>>,
    ) -> anyhow::Result<Vec<(String, HandlerOutcome)>>;
}

type DefaultInvoker = Arc<dyn Fn(RawEnvelope) -> BoxFuture<'static, InvokeResult> + Send + Sync>;
type BatchedInvoker =
    Arc<dyn Fn(Vec<RawEnvelope>) -> BoxFuture<'static, Vec<(String, InvokeResult)>> + Send + Sync>;
type FifoBatchedInvoker = Arc<
    dyn Fn(String, Vec<RawEnvelope>) -> BoxFuture<'static, Vec<(String, InvokeResult)>> + Send + Sync,
>;

/// The tagged variant across the four handler shapes.
#[derive(Clone)]
pub enum HandlerVariant {
    Default(DefaultInvoker),
    Batched(BatchedInvoker),
    Fifo(DefaultInvoker),
    FifoBatched(FifoBatchedInvoker),
}

fn decode<T: DeserializeOwned>(raw: &RawEnvelope) -> std::result::Result<T, DispatchFailure> {
    serde_json::from_slice(&raw.payload)
        .map_err(|e| DispatchFailure(format!("deserialization failed for {}: {e}", raw.message_type)))
}

fn outcome_of(result: anyhow::Result<HandlerOutcome>) -> HandlerOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => HandlerOutcome::Failed { error: Some(e.to_string()) },
    }
}

/// Maps `MessageType` to a dispatch descriptor. Populated once at
/// startup, read thereafter — no runtime mutation while loops are
/// active.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, HandlerVariant>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, message_type: &str) -> Option<&HandlerVariant> {
        self.entries.get(message_type)
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.entries.contains_key(message_type)
    }

    fn insert(&mut self, message_type: impl Into<String>, variant: HandlerVariant) -> Result<()> {
        if self.entries.len() >= MAX_REGISTERED_HANDLERS {
            return Err(InboxError::Config(format!(
                "handler registry is full (max {MAX_REGISTERED_HANDLERS} distinct message types)"
            )));
        }
        self.entries.insert(message_type.into(), variant);
        Ok(())
    }

    pub fn register_default<T, H>(&mut self, message_type: impl Into<String>, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: DefaultHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: DefaultInvoker = Arc::new(move |raw| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let body: T = decode(&raw)?;
                let envelope = Envelope {
                    id: raw.id,
                    message_type: raw.message_type,
                    group_id: raw.group_id,
                    attempts_count: raw.attempts_count,
                    received_at: raw.received_at,
                    body,
                };
                Ok(outcome_of(handler.handle(envelope).await))
            })
        });
        self.insert(message_type, HandlerVariant::Default(invoker))
    }

    pub fn register_fifo<T, H>(&mut self, message_type: impl Into<String>, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: FifoHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: DefaultInvoker = Arc::new(move |raw| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let body: T = decode(&raw)?;
                let envelope = Envelope {
                    id: raw.id,
                    message_type: raw.message_type,
                    group_id: raw.group_id,
                    attempts_count: raw.attempts_count,
                    received_at: raw.received_at,
                    body,
                };
                Ok(outcome_of(handler.handle(envelope).await))
            })
        });
        self.insert(message_type, HandlerVariant::Fifo(invoker))
    }

    pub fn register_batched<T, H>(&mut self, message_type: impl Into<String>, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: BatchedHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: BatchedInvoker = Arc::new(move |raws| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                decode_and_call_batch(raws, move |envelopes| {
                    let handler = Arc::clone(&handler);
                    async move { handler.handle_batch(envelopes).await }
                })
                .await
            })
        });
        self.insert(message_type, HandlerVariant::Batched(invoker))
    }

    pub fn register_fifo_batched<T, H>(&mut self, message_type: impl Into<String>, handler: H) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: FifoBatchedHandler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: FifoBatchedInvoker = Arc::new(move |group_id, raws| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                decode_and_call_batch(raws, move |envelopes| {
                    let handler = Arc::clone(&handler);
                    let group_id = group_id.clone();
                    async move { handler.handle_batch(group_id, envelopes).await }
                })
                .await
            })
        });
        self.insert(message_type, HandlerVariant::FifoBatched(invoker))
    }
}

/// Shared by batched and FIFO-batched registration: decode every raw
/// envelope, route deserialization failures straight into the result
/// vector as `DispatchFailure`s (excluded from the handler call, per
/// envelope construction), and call the handler with the rest.
async fn decode_and_call_batch<T, F, Fut>(
    raws: Vec<RawEnvelope>,
    call: F,
) -> Vec<(String, InvokeResult)>
where
    T: DeserializeOwned + Send + 'static,
    F: FnOnce(Vec<Envelope<T>>) -> Fut,
    Fut: Future<Output = anyhow::Result<Vec<(String, HandlerOutcome)>>>,
{
    let mut results = Vec::with_capacity(raws.len());
    let mut envelopes = Vec::with_capacity(raws.len());
    for raw in raws {
        match decode::<T>(&raw) {
            Ok(body) => envelopes.push(Envelope {
                id: raw.id,
                message_type: raw.message_type,
                group_id: raw.group_id,
                attempts_count: raw.attempts_count,
                received_at: raw.received_at,
                body,
            }),
            Err(failure) => results.push((raw.id, Err(failure))),
        }
    }

    if envelopes.is_empty() {
        return results;
    }

    let ids: Vec<String> = envelopes.iter().map(|e| e.id.clone()).collect();
    match call(envelopes).await {
        Ok(outcomes) => {
            for (id, outcome) in outcomes {
                results.push((id, Ok(outcome)));
            }
        }
        Err(e) => {
            let error = e.to_string();
            for id in ids {
                results.push((id, Ok(HandlerOutcome::Failed { error: Some(error.clone()) })));
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Ping {
        #[allow(dead_code)]
        value: u32,
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl DefaultHandler<Ping> for AlwaysSucceeds {
        async fn handle(&self, _envelope: Envelope<Ping>) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::Success)
        }
    }

    #[tokio::test]
    async fn registered_default_handler_dispatches() {
        let mut registry = HandlerRegistry::new();
        registry.register_default("ping", AlwaysSucceeds).unwrap();
        let variant = registry.lookup("ping").expect("registered");
        let HandlerVariant::Default(invoker) = variant else { panic!("wrong variant") };
        let raw = RawEnvelope {
            id: "1".into(),
            message_type: "ping".into(),
            group_id: None,
            attempts_count: 0,
            received_at: Utc::now(),
            payload: b"{\"value\":1}".to_vec(),
        };
        let result = invoker(raw).await;
        assert!(matches!(result, Ok(HandlerOutcome::Success)));
    }

    #[tokio::test]
    async fn bad_payload_is_dispatch_failure() {
        let mut registry = HandlerRegistry::new();
        registry.register_default("ping", AlwaysSucceeds).unwrap();
        let HandlerVariant::Default(invoker) = registry.lookup("ping").unwrap() else { panic!() };
        let raw = RawEnvelope {
            id: "1".into(),
            message_type: "ping".into(),
            group_id: None,
            attempts_count: 0,
            received_at: Utc::now(),
            payload: b"not json".to_vec(),
        };
        let result = invoker(raw).await;
        assert!(result.is_err());
    }

    #[test]
    fn unknown_type_is_not_registered() {
        let registry = HandlerRegistry::new();
        assert!(!registry.contains("unregistered.v9"));
    }
}

//! Shared helpers for the four processing strategies: message
//! grouping and the timeout wrapper every handler invocation goes
//! through.

use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;

use crate::context::ProcessingContext;
use crate::model::{HandlerOutcome, InboxMessage};
use crate::registry::{HandlerRegistry, HandlerVariant, RawEnvelope};

/// Wraps a handler invocation future in `max_processing_time`. On
/// timeout, yields `Failed` and the caller's outcome is dropped (the
/// handler's own cancellation, if it respects it, is left to the
/// underlying future being dropped here).
pub async fn execute_with_timeout<F, T>(max_processing_time: Duration, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    match timeout(max_processing_time, fut).await {
        Ok(value) => Some(value),
        Err(_) => None,
    }
}

pub fn raw_envelope(message: &InboxMessage) -> RawEnvelope {
    RawEnvelope {
        id: message.id.clone(),
        message_type: message.message_type.clone(),
        group_id: message.group_id.clone(),
        attempts_count: message.attempts_count,
        received_at: message.received_at,
        payload: message.payload.clone(),
    }
}

/// Resolves and invokes a single message against the registry's
/// `Default`/`Fifo` variant, applying the timeout and classifying the
/// result into `ctx`. Dispatch failures (unknown type, missing handler,
/// deserialization) go straight to dead letter.
pub async fn dispatch_one(
    message: &InboxMessage,
    registry: &HandlerRegistry,
    ctx: &ProcessingContext,
    max_processing_time: Duration,
) {
    let Some(variant) = registry.lookup(&message.message_type) else {
        ctx.dispatch_failure(&message.id, format!("unknown message type {:?}", message.message_type));
        return;
    };
    let invoker = match variant {
        HandlerVariant::Default(invoker) | HandlerVariant::Fifo(invoker) => invoker,
        _ => {
            ctx.dispatch_failure(
                &message.id,
                format!("message type {:?} is not registered for single-message dispatch", message.message_type),
            );
            return;
        }
    };

    let raw = raw_envelope(message);
    match execute_with_timeout(max_processing_time, invoker(raw)).await {
        Some(Ok(outcome)) => ctx.classify(message, outcome),
        Some(Err(failure)) => ctx.dispatch_failure(&message.id, failure.0),
        None => {
            warn!(message_id = %message.id, "handler timed out");
            ctx.classify(message, HandlerOutcome::Failed { error: Some("handler timed out".into()) });
        }
    }
}

/// Groups messages by a key while preserving relative order within
/// each group (stable grouping, matching "never reorders messages
/// within a group").
pub fn group_by<K, F>(messages: Vec<InboxMessage>, key_fn: F) -> Vec<(K, Vec<InboxMessage>)>
where
    K: Eq + std::hash::Hash + Clone,
    F: Fn(&InboxMessage) -> K,
{
    let mut order: Vec<K> = Vec::new();
    let mut groups: std::collections::HashMap<K, Vec<InboxMessage>> = std::collections::HashMap::new();
    for message in messages {
        let key = key_fn(&message);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(message);
    }
    order.into_iter().map(|k| { let v = groups.remove(&k).unwrap(); (k, v) }).collect()
}

/// Splits an already-ordered group into maximal runs of consecutive
/// same-`MessageType` messages, preserving order (FIFO-Batched).
pub fn split_into_runs(messages: Vec<InboxMessage>) -> Vec<Vec<InboxMessage>> {
    let mut runs: Vec<Vec<InboxMessage>> = Vec::new();
    for message in messages {
        match runs.last_mut() {
            Some(run) if run.last().map(|m| m.message_type == message.message_type).unwrap_or(false) => {
                run.push(message);
            }
            _ => runs.push(vec![message]),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(id: &str, message_type: &str, group: Option<&str>) -> InboxMessage {
        InboxMessage {
            id: id.into(),
            inbox_name: "orders".into(),
            message_type: message_type.into(),
            payload: vec![],
            group_id: group.map(String::from),
            collapse_key: None,
            deduplication_id: None,
            attempts_count: 0,
            received_at: Utc::now(),
            captured_at: None,
            captured_by: None,
        }
    }

    #[test]
    fn split_into_runs_groups_consecutive_same_type() {
        let messages = vec![
            msg("1", "a", Some("g")),
            msg("2", "a", Some("g")),
            msg("3", "b", Some("g")),
            msg("4", "a", Some("g")),
        ];
        let runs = split_into_runs(messages);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 1);
        assert_eq!(runs[2].len(), 1);
    }

    #[test]
    fn group_by_preserves_first_seen_order() {
        let messages = vec![msg("1", "a", Some("g2")), msg("2", "a", Some("g1")), msg("3", "a", Some("g2"))];
        let groups = group_by(messages, |m| m.group_id.clone().unwrap());
        assert_eq!(groups[0].0, "g2");
        assert_eq!(groups[1].0, "g1");
        assert_eq!(groups[0].1.len(), 2);
    }
}

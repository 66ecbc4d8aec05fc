//! Per-inbox configuration. Plain options, validated at construction,
//! consumed as immutable snapshots — mirrors `EnhancedProcessorConfig`
//! and `MessageGroupProcessorConfig` elsewhere in this ecosystem.

use std::time::Duration;

use crate::error::{InboxError, Result};

/// The four handler shapes an inbox type may dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxKind {
    Default,
    Batched,
    Fifo,
    FifoBatched,
}

impl InboxKind {
    pub fn is_fifo(&self) -> bool {
        matches!(self, InboxKind::Fifo | InboxKind::FifoBatched)
    }
}

#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub inbox_name: String,
    pub kind: InboxKind,

    pub read_batch_size: u32,
    pub write_batch_size: u32,
    pub max_processing_time: Duration,
    pub polling_interval: Duration,
    pub read_delay: Duration,
    pub shutdown_timeout: Duration,
    pub max_attempts: u32,

    pub enable_dead_letter: bool,
    pub dead_letter_max_message_lifetime: Duration,

    pub max_processing_threads: usize,
    pub max_write_threads: usize,

    pub enable_deduplication: bool,
    pub deduplication_interval: Duration,

    pub enable_lock_extension: bool,
    pub lock_extension_threshold: f64,

    pub retry_policy: RetryPolicy,
}

impl InboxConfig {
    pub fn new(inbox_name: impl Into<String>, kind: InboxKind) -> Self {
        Self {
            inbox_name: inbox_name.into(),
            kind,
            ..Self::default_for(kind)
        }
    }

    fn default_for(kind: InboxKind) -> Self {
        Self {
            inbox_name: String::new(),
            kind,
            read_batch_size: 100,
            write_batch_size: 100,
            max_processing_time: Duration::from_secs(30),
            polling_interval: Duration::from_secs(1),
            read_delay: Duration::from_millis(0),
            shutdown_timeout: Duration::from_secs(30),
            max_attempts: 5,
            enable_dead_letter: true,
            dead_letter_max_message_lifetime: Duration::from_secs(30 * 24 * 3600),
            max_processing_threads: 8,
            max_write_threads: 8,
            enable_deduplication: false,
            deduplication_interval: Duration::from_secs(3600),
            enable_lock_extension: true,
            lock_extension_threshold: 0.5,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Validates option interactions the type alone can't express, and
    /// clamps `lock_extension_threshold` to `[0.1, 0.9]`.
    pub fn validate(mut self) -> Result<Self> {
        if self.inbox_name.trim().is_empty() {
            return Err(InboxError::Config("inbox_name must not be empty".into()));
        }
        if self.read_batch_size == 0 {
            return Err(InboxError::Config("read_batch_size must be > 0".into()));
        }
        if self.max_processing_threads == 0 {
            return Err(InboxError::Config("max_processing_threads must be > 0".into()));
        }
        if self.max_processing_time.is_zero() {
            return Err(InboxError::Config("max_processing_time must be > 0".into()));
        }
        self.lock_extension_threshold = self.lock_extension_threshold.clamp(0.1, 0.9);
        Ok(self)
    }

    /// Interval between lease-extension ticks.
    pub fn lock_extension_interval(&self) -> Duration {
        self.max_processing_time.mul_f64(self.lock_extension_threshold)
    }
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self::default_for(InboxKind::Default)
    }
}

/// Configures a storage provider's internal transient-error retry loop
/// Durable backends wrap `write`/`read_and_capture`/etc. in
/// this policy; the in-memory backend ignores it (nothing to retry).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_lock_extension_threshold() {
        let mut config = InboxConfig::new("orders", InboxKind::Default);
        config.lock_extension_threshold = 1.5;
        let validated = config.validate().unwrap();
        assert_eq!(validated.lock_extension_threshold, 0.9);
    }

    #[test]
    fn validate_rejects_empty_inbox_name() {
        let config = InboxConfig::new("", InboxKind::Default);
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_respects_max_delay() {
        let policy = RetryPolicy { jitter: false, ..RetryPolicy::default() };
        let delay = policy.delay_for_attempt(20);
        assert!(delay <= policy.max_delay);
    }
}

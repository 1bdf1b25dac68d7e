//! Configuration for the batching strategies.

use crate::{Error, ErrorContext, Result};
use std::str::FromStr;
use std::time::Duration;

/// What a batcher does with requests still queued when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClosePolicy {
    /// Flush everything already enqueued before the worker exits.
    #[default]
    Flush,
    /// Drop queued requests unflushed; their callers observe `Error::Abandoned`.
    Abandon,
}

impl FromStr for ClosePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flush" => Ok(ClosePolicy::Flush),
            "abandon" => Ok(ClosePolicy::Abandon),
            other => Err(Error::configuration_with_context(
                format!("unknown close policy '{}'", other),
                ErrorContext::new()
                    .with_field_path("on_close")
                    .with_details("expected 'flush' or 'abandon'"),
            )),
        }
    }
}

/// Configuration shared by every batching strategy
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Size threshold (lock strategy) and mailbox capacity (actor strategy)
    pub batch_limit: usize,

    /// Period of the flush timer used by the time-driven strategies
    pub flush_interval: Duration,

    /// Fixed deadline of every downstream sink call, independent of callers
    pub flush_timeout: Duration,

    /// Override for the bounded mailboxes; `None` uses the strategy default
    pub mailbox_capacity: Option<usize>,

    /// Fixed buffer size reused by the no-alloc greedy strategy
    pub drain_capacity: usize,

    /// Behavior for queued requests at close time
    pub on_close: ClosePolicy,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_limit: 1_000,
            flush_interval: Duration::from_millis(15),
            flush_timeout: Duration::from_secs(1),
            mailbox_capacity: None,
            drain_capacity: 10_000,
            on_close: ClosePolicy::Flush,
        }
    }
}

impl BatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }

    pub fn with_drain_capacity(mut self, capacity: usize) -> Self {
        self.drain_capacity = capacity;
        self
    }

    pub fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.on_close = policy;
        self
    }

    /// Mailbox size for the actor strategy: the batch limit unless overridden.
    pub fn actor_mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.unwrap_or(self.batch_limit)
    }

    /// Mailbox size for the no-alloc greedy strategy: ten batch limits unless overridden.
    pub fn drain_mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
            .unwrap_or_else(|| self.batch_limit.saturating_mul(10))
    }

    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("COALESCE_BATCH_LIMIT")? {
            config.batch_limit = n;
        }
        if let Some(ms) = env_parse::<u64>("COALESCE_FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("COALESCE_FLUSH_TIMEOUT_MS")? {
            config.flush_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("COALESCE_MAILBOX_CAPACITY")? {
            config.mailbox_capacity = Some(n);
        }
        if let Some(n) = env_parse::<usize>("COALESCE_DRAIN_CAPACITY")? {
            config.drain_capacity = n;
        }
        if let Ok(val) = std::env::var("COALESCE_ON_CLOSE") {
            config.on_close = val.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(Error::configuration_with_context(
                    format!("{} must be greater than zero", name),
                    ErrorContext::new()
                        .with_field_path(format!("config.{}", name))
                        .with_source("batcher_config"),
                ))
            }
        };
        positive("batch_limit", self.batch_limit > 0)?;
        positive("flush_interval", !self.flush_interval.is_zero())?;
        positive("flush_timeout", !self.flush_timeout.is_zero())?;
        positive("drain_capacity", self.drain_capacity > 0)?;
        positive("mailbox_capacity", self.mailbox_capacity != Some(0))?;
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration_with_context(
                format!("invalid value '{}'", val),
                ErrorContext::new()
                    .with_field_path(key)
                    .with_source("env"),
            )
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatcherConfig::default();
        assert_eq!(config.batch_limit, 1_000);
        assert_eq!(config.flush_interval, Duration::from_millis(15));
        assert_eq!(config.flush_timeout, Duration::from_secs(1));
        assert_eq!(config.drain_capacity, 10_000);
        assert_eq!(config.on_close, ClosePolicy::Flush);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mailbox_defaults_follow_batch_limit() {
        let config = BatcherConfig::new().with_batch_limit(8);
        assert_eq!(config.actor_mailbox_capacity(), 8);
        assert_eq!(config.drain_mailbox_capacity(), 80);

        let config = config.with_mailbox_capacity(3);
        assert_eq!(config.actor_mailbox_capacity(), 3);
        assert_eq!(config.drain_mailbox_capacity(), 3);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let err = BatcherConfig::new().with_batch_limit(0).validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.clone()),
            Some("config.batch_limit".to_string())
        );
        assert!(BatcherConfig::new()
            .with_mailbox_capacity(0)
            .validate()
            .is_err());
        assert!(BatcherConfig::new()
            .with_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_close_policy_parse() {
        assert_eq!("flush".parse::<ClosePolicy>().unwrap(), ClosePolicy::Flush);
        assert_eq!(" Abandon ".parse::<ClosePolicy>().unwrap(), ClosePolicy::Abandon);
        assert!("drop".parse::<ClosePolicy>().is_err());
    }
}

//! Controller configuration.
//!
//! Values come from defaults, then `EKSPOSE_*` environment variables, then
//! command-line flags (applied by the operator binary).
//!
//! # Environment Variables
//!
//! - `EKSPOSE_WORKERS`: number of concurrent worker loops
//! - `EKSPOSE_NAMESPACE`: restrict the Deployment watch to one namespace
//! - `EKSPOSE_INGRESS_CLASS`: `ingressClassName` set on created Ingresses
//! - `EKSPOSE_QUEUE_BASE_DELAY_MS`: first retry delay
//! - `EKSPOSE_QUEUE_MAX_DELAY_SECS`: retry delay cap
//! - `EKSPOSE_QUEUE_QPS`: overall retry rate
//! - `EKSPOSE_QUEUE_BURST`: overall retry burst

use crate::error::{OperatorError, OperatorResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the whole controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name of the work queue, used in logs.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Number of worker loops pulling from the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Namespace to watch. `None` watches all namespaces.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Ingress class for created Ingresses.
    #[serde(default)]
    pub ingress_class: Option<String>,

    /// Retry behaviour of the work queue.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            workers: default_workers(),
            namespace: None,
            ingress_class: None,
            queue: QueueConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `EKSPOSE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_name: defaults.queue_name,
            workers: env_parse("EKSPOSE_WORKERS").unwrap_or(defaults.workers),
            namespace: env_string("EKSPOSE_NAMESPACE"),
            ingress_class: env_string("EKSPOSE_INGRESS_CLASS"),
            queue: QueueConfig::from_env(),
        }
    }

    /// Set the number of workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Restrict the watch to a namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the ingress class.
    pub fn ingress_class(mut self, class: impl Into<String>) -> Self {
        self.ingress_class = Some(class.into());
        self
    }

    /// Replace the queue configuration.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Reject values the controller cannot run with.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "workers must be at least 1".into(),
            ));
        }
        self.queue.validate()
    }
}

/// Retry behaviour of the work queue.
///
/// A failed key waits for the larger of its own exponential backoff
/// (`base_delay_ms * 2^failures`, capped at `max_delay_secs`) and the delay
/// imposed by a token bucket shared by all keys (`qps`, `burst`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// First per-key retry delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound of the per-key retry delay in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Overall retries per second.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Overall retry burst.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl QueueConfig {
    /// Build from `EKSPOSE_QUEUE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay_ms: env_parse("EKSPOSE_QUEUE_BASE_DELAY_MS")
                .unwrap_or(defaults.base_delay_ms),
            max_delay_secs: env_parse("EKSPOSE_QUEUE_MAX_DELAY_SECS")
                .unwrap_or(defaults.max_delay_secs),
            qps: env_parse("EKSPOSE_QUEUE_QPS").unwrap_or(defaults.qps),
            burst: env_parse("EKSPOSE_QUEUE_BURST").unwrap_or(defaults.burst),
        }
    }

    /// First per-key retry delay.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Per-key retry delay cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    fn validate(&self) -> OperatorResult<()> {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(OperatorError::InvalidConfig(format!(
                "queue qps must be positive, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(OperatorError::InvalidConfig(
                "queue burst must be at least 1".into(),
            ));
        }
        if self.base_delay() > self.max_delay() {
            return Err(OperatorError::InvalidConfig(format!(
                "queue base delay {}ms exceeds max delay {}s",
                self.base_delay_ms, self.max_delay_secs
            )));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn default_queue_name() -> String {
    "ekspose".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.queue_name, "ekspose");
        assert_eq!(config.workers, 1);
        assert!(config.namespace.is_none());
        assert!(config.ingress_class.is_none());
        assert_eq!(config.queue.base_delay(), Duration::from_millis(5));
        assert_eq!(config.queue.max_delay(), Duration::from_secs(1000));
        assert_eq!(config.queue.qps, 10.0);
        assert_eq!(config.queue.burst, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = ControllerConfig::new()
            .workers(4)
            .namespace("ns1")
            .ingress_class("nginx");

        assert_eq!(config.workers, 4);
        assert_eq!(config.namespace.as_deref(), Some("ns1"));
        assert_eq!(config.ingress_class.as_deref(), Some("nginx"));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let config = ControllerConfig::new().workers(0);
        assert!(matches!(
            config.validate(),
            Err(OperatorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_queue_settings() {
        let bad = [
            QueueConfig {
                qps: 0.0,
                ..Default::default()
            },
            QueueConfig {
                burst: 0,
                ..Default::default()
            },
            QueueConfig {
                base_delay_ms: 5_000,
                max_delay_secs: 1,
                ..Default::default()
            },
        ];
        for queue in bad {
            let config = ControllerConfig::new().queue(queue);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"workers": 3, "queue": {"qps": 2.5}}"#).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_name, "ekspose");
        assert_eq!(config.queue.qps, 2.5);
        assert_eq!(config.queue.burst, 100);
    }
}

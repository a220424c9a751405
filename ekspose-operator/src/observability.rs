//! Logging setup.
//!
//! # Environment Variables
//!
//! - `EKSPOSE_LOG_FORMAT`: "json", "pretty", or "compact"
//! - `EKSPOSE_LOG_LEVEL` or `RUST_LOG`: filter directives
//! - `EKSPOSE_LOG_LOCATION`: "true" to include file and line

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON lines, for log collectors.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    log_format: LogFormat,
    log_filter: String,
    include_location: bool,
    include_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: default_filter().to_string(),
            include_location: false,
            include_target: true,
        }
    }
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Create configuration from the process environment.
    ///
    /// Without `EKSPOSE_LOG_FORMAT` the format is pretty on a terminal and
    /// JSON otherwise.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_format = lookup("EKSPOSE_LOG_FORMAT")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                if std::io::IsTerminal::is_terminal(&std::io::stdout()) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            });

        let log_filter = lookup("EKSPOSE_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| default_filter().to_string());

        Self {
            log_format,
            log_filter,
            include_location: lookup("EKSPOSE_LOG_LOCATION")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
            include_target: true,
        }
    }

    /// Get the log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Get the log filter.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Check if source location should be included.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Check if target should be included.
    pub fn include_target(&self) -> bool {
        self.include_target
    }
}

/// Builder for [`TracingConfig`], starting from the environment.
#[derive(Debug, Clone, Default)]
pub struct TracingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_target: Option<bool>,
}

impl TracingConfigBuilder {
    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the log filter.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Set whether to include file and line.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Set whether to include the target.
    pub fn include_target(mut self, include: bool) -> Self {
        self.include_target = Some(include);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        self.build_over(TracingConfig::from_env())
    }

    fn build_over(self, base: TracingConfig) -> TracingConfig {
        TracingConfig {
            log_format: self.log_format.unwrap_or(base.log_format),
            log_filter: self.log_filter.unwrap_or(base.log_filter),
            include_location: self.include_location.unwrap_or(base.include_location),
            include_target: self.include_target.unwrap_or(base.include_target),
        }
    }
}

/// Filter used when neither `-v` nor the environment says otherwise.
pub fn default_filter() -> &'static str {
    "info,kube=warn,hyper=warn,tower=warn"
}

/// Filter for `-v` repeated `verbosity` times.
pub fn verbosity_filter(verbosity: u8) -> Option<&'static str> {
    match verbosity {
        0 => None,
        1 => Some("debug,kube=info,hyper=warn,tower=warn"),
        _ => Some("trace"),
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_filter())
        .unwrap_or_else(|_| EnvFilter::new(default_filter()));

    let result = match config.log_format() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target())
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target()),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location())
                    .with_line_number(config.include_location())
                    .with_target(config.include_target()),
            )
            .try_init(),
    };
    result.context("Failed to initialize tracing subscriber")
}

//! Worker configuration.
//!
//! Every section is optional in the source document; missing fields take the
//! defaults below. Durations are given in milliseconds.
//!
//! ```json
//! {
//!   "rate_limiter": {
//!     "enabled": true,
//!     "default": { "requests_per_second": 10, "burst_size": 20 },
//!     "by_event_type": {
//!       "material_uploaded": { "requests_per_second": 2, "burst_size": 5 }
//!     }
//!   },
//!   "circuit_breakers": { "nlp": { "max_failures": 3, "timeout_ms": 30000 } },
//!   "retry": { "max_attempts": 4, "initial_backoff_ms": 500 },
//!   "shutdown": { "timeout_ms": 30000, "wait_for_messages": true },
//!   "logging": { "level": "info", "format": "json" }
//! }
//! ```

use crate::application::circuit_breaker::CircuitBreakerConfig;
use crate::application::ports::MetricsRecorder;
use crate::application::registry::MultiKeyLimiter;
use crate::domain::policy::{RatePolicy, RetryPolicy};
use crate::infrastructure::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
const DEFAULT_BURST_SIZE: f64 = 20.0;

const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_BREAKER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_HALF_OPEN_REQUESTS: u32 = 1;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
const DEFAULT_FAILURE_RESET_WINDOW_MS: u64 = 30_000;

const DEFAULT_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level worker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breakers: CircuitBreakersConfig,
    pub retry: RetryConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values that would silently misbehave at runtime.
    ///
    /// Zero-valued breaker fields are not errors; they fall back to the
    /// defaults when the breaker config is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limiter.validate()?;
        self.retry.validate()?;
        if self.shutdown.timeout_ms == 0 {
            return Err(ConfigError::invalid("shutdown.timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

/// One token bucket's settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    pub requests_per_second: f64,
    pub burst_size: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_size: DEFAULT_BURST_SIZE,
        }
    }
}

impl RateSettings {
    pub fn policy(&self) -> RatePolicy {
        RatePolicy::new(self.requests_per_second, self.burst_size)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !self.requests_per_second.is_finite() || self.requests_per_second < 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.requests_per_second"),
                "must be a non-negative number",
            ));
        }
        if !self.burst_size.is_finite() || self.burst_size < 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.burst_size"),
                "must be a non-negative number",
            ));
        }
        Ok(())
    }
}

/// Per-event-type rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Policy for event types without an explicit entry.
    pub default: RateSettings,
    pub by_event_type: BTreeMap<String, RateSettings>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateSettings::default(),
            by_event_type: BTreeMap::new(),
        }
    }
}

impl RateLimiterConfig {
    /// Build the limiter described by this section.
    ///
    /// A disabled limiter admits everything: no buckets, no default policy.
    pub fn build_limiter(&self, metrics: Arc<dyn MetricsRecorder>) -> MultiKeyLimiter {
        if !self.enabled {
            return MultiKeyLimiter::builder().metrics(metrics).build();
        }
        MultiKeyLimiter::builder()
            .policies(
                self.by_event_type
                    .iter()
                    .map(|(event_type, settings)| (event_type.clone(), settings.policy())),
            )
            .default_policy(self.default.policy())
            .metrics(metrics)
            .build()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate("rate_limiter.default")?;
        for (event_type, settings) in &self.by_event_type {
            settings.validate(&format!("rate_limiter.by_event_type.{event_type}"))?;
        }
        Ok(())
    }
}

/// Breakers for the two downstream dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    pub nlp: BreakerSettings,
    pub storage: BreakerSettings,
}

/// Settings for one circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub max_failures: u32,
    pub timeout_ms: u64,
    /// Concurrent probes while half-open.
    pub max_requests: u32,
    pub success_threshold: u32,
    pub failure_reset_window_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            timeout_ms: DEFAULT_BREAKER_TIMEOUT_MS,
            max_requests: DEFAULT_MAX_HALF_OPEN_REQUESTS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            failure_reset_window_ms: DEFAULT_FAILURE_RESET_WINDOW_MS,
        }
    }
}

impl BreakerSettings {
    /// Breaker config under `name`, zero fields replaced by defaults.
    pub fn to_config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            max_failures: self.max_failures,
            timeout: Duration::from_millis(self.timeout_ms),
            max_half_open_requests: self.max_requests,
            success_threshold: self.success_threshold,
            failure_reset_window: Duration::from_millis(self.failure_reset_window_ms),
        }
        .with_defaults()
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.max_backoff_ms",
                "must not be smaller than initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Graceful shutdown settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub timeout_ms: u64,
    /// Wait for in-flight messages before tearing down.
    pub wait_for_messages: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            wait_for_messages: true,
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

//! Configuration module for SitePulse Agent.
//!
//! Options can come from a JSON options object (camelCase keys, the same shape
//! a page passes to the browser agent) or from environment variables. Every
//! option has a default, so an empty object or an empty environment is valid.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SITEPULSE_FLUSH_INTERVAL_MS` | 5000 | Periodic flush cadence (0 disables) |
//! | `SITEPULSE_FLUSH_MAX_EVENTS` | 20 | Queue length that triggers a flush |
//! | `SITEPULSE_MAX_QUEUE_SIZE` | 500 | Queue capacity, oldest dropped on overflow |
//! | `SITEPULSE_MAX_META_BYTES` | 2048 | Serialized metadata size cap |
//! | `SITEPULSE_DROP_URL_QUERY` | false | Strip query strings from tracked URLs |
//! | `SITEPULSE_ALLOW_BATCH` | true | Attempt batch delivery |
//! | `SITEPULSE_COMPRESS_PAYLOAD` | true | Gzip payloads above the threshold |
//! | `SITEPULSE_MAX_RETRY_ATTEMPTS` | 5 | Attempts before an event is dropped |
//! | `SITEPULSE_RETRY_BACKOFF_MS` | 1000 | Initial retry delay |
//! | `SITEPULSE_RETRY_MAX_DELAY_MS` | 30000 | Retry delay cap |
//! | `SITEPULSE_RETRY_JITTER_MS` | 500 | Upper bound of random retry jitter |
//!
//! The API key and ingest URL are not configuration variables here; they are
//! resolved by [`crate::identity::resolve_credentials`].
//!
//! # Example
//!
//! ```
//! use sitepulse_agent::config::AgentConfig;
//!
//! let config = AgentConfig::from_json_str(r#"{ "flushMaxEvents": 5, "dropUrlQuery": true }"#)
//!     .expect("valid options");
//! assert_eq!(config.flush_max_events, 5);
//! assert!(config.drop_url_query);
//! assert_eq!(config.max_queue_size, 500);
//! ```

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::privacy::MetaAllowlist;

/// Default periodic flush cadence in milliseconds.
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Default queue length that triggers an immediate flush.
const DEFAULT_FLUSH_MAX_EVENTS: usize = 20;

/// Default queue capacity.
const DEFAULT_MAX_QUEUE_SIZE: usize = 500;

/// Default scroll depth step in percent.
const DEFAULT_SCROLL_STEP: u8 = 25;

/// Default minimum time between scroll events in milliseconds.
const DEFAULT_SCROLL_THROTTLE_MS: u64 = 500;

/// Default metadata size cap in bytes.
const DEFAULT_MAX_META_BYTES: usize = 2_048;

/// Default minimum payload size for compression in bytes.
const DEFAULT_COMPRESS_THRESHOLD_BYTES: usize = 1_024;

/// Default attempts before an event is dropped.
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Default initial retry delay in milliseconds.
const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;

/// Default retry delay cap in milliseconds.
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Default retry jitter bound in milliseconds.
const DEFAULT_RETRY_JITTER_MS: u64 = 500;

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An option has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// The options object is not valid JSON for this schema.
    #[error("invalid options JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The options file could not be read.
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),
}

/// Tuning options for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Periodic flush cadence in milliseconds; 0 disables the timer.
    pub flush_interval_ms: u64,

    /// Queue length that triggers an immediate flush.
    pub flush_max_events: usize,

    /// Queue capacity; the oldest event is dropped on overflow.
    pub max_queue_size: usize,

    /// Scroll depth (percent) that must be gained before another scroll event.
    pub scroll_step: u8,

    /// Minimum time between scroll events in milliseconds.
    pub scroll_throttle_ms: u64,

    /// Serialized metadata size cap in bytes.
    pub max_meta_bytes: usize,

    /// Strip the query string from tracked URLs.
    pub drop_url_query: bool,

    /// Attempt batch delivery when more than one event is pending.
    pub allow_batch: bool,

    /// Detect the page's technology stack once and attach it to page views.
    pub include_stack_hints: bool,

    /// Gzip payloads at or above `compress_threshold_bytes`.
    pub compress_payload: bool,

    pub compress_threshold_bytes: usize,

    /// Attempts before an event is dropped permanently.
    pub max_retry_attempts: u32,

    pub retry_backoff_ms: u64,

    pub retry_max_delay_ms: u64,

    /// Retry jitter is drawn from `[0, retry_jitter_ms)`.
    pub retry_jitter_ms: u64,

    /// Permitted metadata fields per event type.
    pub meta_allowlist: MetaAllowlist,

    /// Explicit API key, taking precedence over environment lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Explicit ingestion URL, taking precedence over environment lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            flush_max_events: DEFAULT_FLUSH_MAX_EVENTS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scroll_step: DEFAULT_SCROLL_STEP,
            scroll_throttle_ms: DEFAULT_SCROLL_THROTTLE_MS,
            max_meta_bytes: DEFAULT_MAX_META_BYTES,
            drop_url_query: false,
            allow_batch: true,
            include_stack_hints: true,
            compress_payload: true,
            compress_threshold_bytes: DEFAULT_COMPRESS_THRESHOLD_BYTES,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
            meta_allowlist: MetaAllowlist::default(),
            api_key: None,
            ingest_url: None,
        }
    }
}

impl AgentConfig {
    /// Parses a JSON options object and validates it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Json` for malformed JSON or mistyped options and
    /// `ConfigError::InvalidValue` when validation fails.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON options file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise the
    /// same errors as [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Creates a configuration from `SITEPULSE_*` environment variables,
    /// falling back to defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed or
    /// the resulting configuration fails validation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sitepulse_agent::config::AgentConfig;
    ///
    /// std::env::set_var("SITEPULSE_MAX_QUEUE_SIZE", "100");
    /// let config = AgentConfig::from_env().unwrap();
    /// assert_eq!(config.max_queue_size, 100);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_env("SITEPULSE_FLUSH_INTERVAL_MS")? {
            config.flush_interval_ms = ms;
        }
        if let Some(count) = parse_env("SITEPULSE_FLUSH_MAX_EVENTS")? {
            config.flush_max_events = count;
        }
        if let Some(size) = parse_env("SITEPULSE_MAX_QUEUE_SIZE")? {
            config.max_queue_size = size;
        }
        if let Some(bytes) = parse_env("SITEPULSE_MAX_META_BYTES")? {
            config.max_meta_bytes = bytes;
        }
        if let Some(flag) = parse_env_bool("SITEPULSE_DROP_URL_QUERY")? {
            config.drop_url_query = flag;
        }
        if let Some(flag) = parse_env_bool("SITEPULSE_ALLOW_BATCH")? {
            config.allow_batch = flag;
        }
        if let Some(flag) = parse_env_bool("SITEPULSE_COMPRESS_PAYLOAD")? {
            config.compress_payload = flag;
        }
        if let Some(attempts) = parse_env("SITEPULSE_MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = attempts;
        }
        if let Some(ms) = parse_env("SITEPULSE_RETRY_BACKOFF_MS")? {
            config.retry_backoff_ms = ms;
        }
        if let Some(ms) = parse_env("SITEPULSE_RETRY_MAX_DELAY_MS")? {
            config.retry_max_delay_ms = ms;
        }
        if let Some(ms) = parse_env("SITEPULSE_RETRY_JITTER_MS")? {
            config.retry_jitter_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(invalid("maxQueueSize", "queue size must be greater than 0"));
        }
        if self.flush_max_events == 0 {
            return Err(invalid(
                "flushMaxEvents",
                "flush threshold must be greater than 0",
            ));
        }
        if self.retry_backoff_ms == 0 {
            return Err(invalid(
                "retryBackoffMs",
                "retry backoff must be greater than 0",
            ));
        }
        if self.retry_max_delay_ms < self.retry_backoff_ms {
            return Err(invalid(
                "retryMaxDelayMs",
                format!(
                    "max delay ({}) must be at least the initial backoff ({})",
                    self.retry_max_delay_ms, self.retry_backoff_ms
                ),
            ));
        }
        if !(1..=100).contains(&self.scroll_step) {
            return Err(invalid(
                "scrollStep",
                format!("scroll step must be between 1 and 100, got {}", self.scroll_step),
            ));
        }
        Ok(())
    }

    /// Periodic flush cadence, or `None` when the timer is disabled.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms))
    }

    #[must_use]
    pub fn scroll_throttle(&self) -> Duration {
        Duration::from_millis(self.scroll_throttle_ms)
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Parses an optional environment variable.
fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(val) => val.trim().parse::<T>().map(Some).map_err(|_| {
            invalid(key, format!("expected non-negative integer, got '{val}'"))
        }),
        Err(_) => Ok(None),
    }
}

/// Parses an optional boolean environment variable.
fn parse_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(invalid(key, format!("expected boolean, got '{val}'"))),
        },
        Err(_) => Ok(None),
    }
}

//! Engine settings loaded from TOML and the environment.
//!
//! Settings are kept in plain millisecond and count fields so they read well in
//! a config file, then converted into a [`QueueConfig`] for the engine.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SyncError};
use crate::queue::QueueConfig;
use crate::retry::RetryPolicy;

/// Prefix for environment overrides, e.g. `CONCERN_SYNC__RETRY__MAX_ATTEMPTS=5`.
pub const ENV_PREFIX: &str = "CONCERN_SYNC";

fn default_delay_ms() -> u64 {
    500
}

fn default_max_wait_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Debounce window in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Max-wait ceiling in milliseconds.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Entries submitted concurrently per drain.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-call retry settings.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Outer re-enqueue settings.
    #[serde(default)]
    pub requeue: RequeueSettings,
}

/// Settings for retrying a single remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Error kinds worth retrying at all.
    #[serde(default = "RetryPolicy::default_retryable_kinds")]
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

/// Settings for re-enqueueing entries that exhausted their call retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequeueSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            max_wait_ms: default_max_wait_ms(),
            batch_size: default_batch_size(),
            retry: RetrySettings::default(),
            requeue: RequeueSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_kinds: RetryPolicy::default_retryable_kinds(),
        }
    }
}

impl Default for RequeueSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetrySettings {
    /// Builds the equivalent retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_multiplier,
        )
        .with_retryable_kinds(self.retryable_kinds.iter().copied())
    }
}

impl SyncSettings {
    /// Load settings from a TOML file, with environment overrides.
    ///
    /// Environment variables use the `CONCERN_SYNC__` prefix and `__` between
    /// nested keys, e.g. `CONCERN_SYNC__REQUEUE__MAX_RETRIES=5`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be parsed, or holds
    /// values the engine cannot use.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| SyncError::InvalidSettings(format!("invalid path {:?}", path)))?;

        if !path.exists() {
            return Err(SyncError::SettingsNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::with_name(path_str))
            .add_source(Self::environment())
            .build()?;

        let settings: SyncSettings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, SyncError> {
        let config = Config::builder().add_source(Self::environment()).build()?;
        let settings: SyncSettings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        self.to_queue_config().validate()
    }

    /// Converts the settings into queue configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .with_delay(Duration::from_millis(self.delay_ms))
            .with_max_wait(Duration::from_millis(self.max_wait_ms))
            .with_batch_size(self.batch_size)
            .with_retry(self.retry.to_policy())
            .with_requeue(RetryPolicy::requeue(
                self.requeue.max_retries,
                Duration::from_millis(self.requeue.base_delay_ms),
            ))
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> Result<String, SyncError> {
        toml::to_string_pretty(self)
            .map_err(|e| SyncError::InvalidSettings(format!("cannot render settings: {e}")))
    }
}

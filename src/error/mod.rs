//! Error handling and classification module
//!
//! This module turns raw failures from the remote status store into
//! [`ClassifiedError`]s, and defines [`SyncError`] for engine setup failures.

pub mod classification;
pub mod classifier;

use thiserror::Error;

// Re-export main types for convenient access
pub use classification::{ClassifiedError, ErrorKind, ErrorSeverity, RemoteFailure};
pub use classifier::{Classify, ErrorClassifier, ErrorPattern};

/// Errors raised while configuring or building the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No Tokio runtime was available to drive timers.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The settings file or environment could not be read.
    #[error("failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),

    /// The settings file does not exist.
    #[error("settings file not found: {0}")]
    SettingsNotFound(String),

    /// The settings were read but are not usable.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// The builder was missing a required collaborator.
    #[error("missing {0}")]
    Missing(&'static str),
}

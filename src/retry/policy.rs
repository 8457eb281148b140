//! Retry policy with deterministic exponential backoff.
//!
//! One [`RetryPolicy`] type serves both retry layers: the controller's
//! per-call attempts and the update queue's outer re-enqueue budget.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{ClassifiedError, ErrorKind, SyncError};

/// Backoff and budget settings for retrying failed operations.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Kinds this policy is willing to retry.
    pub retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            retryable_kinds: Self::default_retryable_kinds(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy retrying the default transient kinds.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_multiplier,
            retryable_kinds: Self::default_retryable_kinds(),
        }
    }

    /// Outer queue-level policy: the original submission plus up to
    /// `max_retries` re-enqueues, doubling from `base_delay`.
    pub fn requeue(max_retries: u32, base_delay: Duration) -> Self {
        Self::new(
            max_retries.saturating_add(1),
            base_delay,
            Duration::from_millis(30_000),
            2.0,
        )
    }

    /// Kinds retried unless configured otherwise.
    pub fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
        ErrorKind::ALL
            .into_iter()
            .filter(|kind| kind.is_retryable())
            .collect()
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Restricts the kinds this policy retries.
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Delay to wait after `attempt` (1-based) failed:
    /// `min(base_delay * backoff_multiplier^(attempt - 1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_millis = self.base_delay.as_millis() as f64;
        let max_millis = self.max_delay.as_millis() as f64;
        let millis = base_millis * self.backoff_multiplier.powi(exponent);

        if millis.is_finite() && millis < max_millis {
            Duration::from_millis(millis.max(0.0).round() as u64)
        } else {
            self.max_delay
        }
    }

    /// Number of attempts allowed for failures of `kind`. Unrecognized
    /// failures get one attempt fewer than the rest.
    pub fn budget_for(&self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Unknown => self.max_attempts.saturating_sub(1).max(1),
            _ => self.max_attempts,
        }
    }

    /// Whether an operation that has made `attempts` attempts and just failed
    /// with `error` should be tried again.
    pub fn should_retry(&self, attempts: u32, error: &ClassifiedError) -> bool {
        error.retryable
            && self.retryable_kinds.contains(&error.kind)
            && attempts < self.budget_for(error.kind)
    }

    /// Rejects settings the controller cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidSettings(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidSettings(format!(
                "retry backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(SyncError::InvalidSettings(
                "retry max_delay must not be shorter than base_delay".to_string(),
            ));
        }
        Ok(())
    }
}

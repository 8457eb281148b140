//! Queue entries, configuration and introspection types.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// A pending status change for one entity.
///
/// At most one entry exists per entity. A newer request replaces
/// `desired_status`, resets `retry_count` and bumps `revision`, but keeps
/// `enqueued_at` so the max-wait ceiling is measured from the first unsent
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdateEntry<S> {
    /// Entity whose status is being synchronized.
    pub entity_id: String,
    /// Latest status requested for the entity.
    pub desired_status: S,
    /// When the first unsent request for the entity arrived.
    pub enqueued_at: Instant,
    /// Outer retries already spent on this entry.
    pub retry_count: u32,
    /// Request number of the latest request folded into this entry.
    pub revision: u64,
}

impl<S> StatusUpdateEntry<S> {
    /// Creates a fresh entry stamped with the current time.
    pub fn new(entity_id: impl Into<String>, desired_status: S, revision: u64) -> Self {
        Self {
            entity_id: entity_id.into(),
            desired_status,
            enqueued_at: Instant::now(),
            retry_count: 0,
            revision,
        }
    }

    /// Folds a newer request into this entry.
    pub fn coalesce(&mut self, desired_status: S, revision: u64) {
        self.desired_status = desired_status;
        self.retry_count = 0;
        self.revision = revision;
    }
}

/// Snapshot of the queue for callers and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingInfo {
    /// Entries waiting to be submitted, including those waiting on a retry.
    pub pending_count: usize,
    /// Whether a batch is currently being submitted.
    pub is_processing: bool,
    /// Ids of the entities with pending entries, sorted.
    pub pending_entity_ids: Vec<String>,
}

/// Timing, batching and retry settings for the update queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Quiet period after the last request before an entity is submitted.
    pub delay: Duration,
    /// Longest an entity may wait while requests keep arriving.
    pub max_wait: Duration,
    /// Maximum entries submitted concurrently per drain.
    pub batch_size: usize,
    /// Policy applied to each remote call.
    pub retry: RetryPolicy,
    /// Policy for re-enqueueing entries whose calls exhausted `retry`.
    pub requeue: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_wait: Duration::from_millis(2000),
            batch_size: 10,
            retry: RetryPolicy::default(),
            requeue: RetryPolicy::requeue(3, Duration::from_millis(1000)),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the debounce window.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the max-wait ceiling.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the per-call retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the outer re-enqueue policy.
    pub fn with_requeue(mut self, requeue: RetryPolicy) -> Self {
        self.requeue = requeue;
        self
    }

    /// Rejects configurations the queue cannot honor.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 {
            return Err(SyncError::InvalidSettings(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_wait < self.delay {
            return Err(SyncError::InvalidSettings(format!(
                "max_wait ({:?}) must not be shorter than delay ({:?})",
                self.max_wait, self.delay
            )));
        }
        self.retry.validate()?;
        self.requeue.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.delay, Duration::from_millis(500));
        assert_eq!(config.max_wait, Duration::from_millis(2000));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.requeue.max_attempts, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(QueueConfig::new().with_batch_size(0).validate().is_err());
        assert!(QueueConfig::new()
            .with_delay(Duration::from_secs(3))
            .validate()
            .is_err());
        assert!(QueueConfig::new()
            .with_retry(RetryPolicy::default().with_max_attempts(0))
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_keeps_enqueued_at() {
        let mut entry = StatusUpdateEntry::new("c1", "addressed", 1);
        entry.retry_count = 2;
        let first_seen = entry.enqueued_at;

        tokio::time::advance(Duration::from_millis(100)).await;
        entry.coalesce("rejected", 2);

        assert_eq!(entry.desired_status, "rejected");
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.revision, 2);
        assert_eq!(entry.enqueued_at, first_seen);
    }
}

//! Retry controller for remote status operations.
//!
//! [`RetryController::execute`] runs an operation, classifies each failure and
//! either waits out the policy's backoff and tries again, or gives up with the
//! classified error.

pub mod policy;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ClassifiedError, Classify, RemoteFailure};
use crate::scheduler::Scheduler;

pub use policy::RetryPolicy;

/// Executes operations under a [`RetryPolicy`].
///
/// The controller holds no mutable state; clones share the same classifier
/// and scheduler.
#[derive(Clone)]
pub struct RetryController {
    classifier: Arc<dyn Classify>,
    scheduler: Arc<dyn Scheduler>,
}

impl RetryController {
    /// Creates a controller from an injected classifier and scheduler.
    pub fn new(classifier: Arc<dyn Classify>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            classifier,
            scheduler,
        }
    }

    /// The classifier used to judge failures.
    pub fn classifier(&self) -> &Arc<dyn Classify> {
        &self.classifier
    }

    /// The scheduler used for backoff waits.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Runs `operation` until it succeeds or `policy` gives up.
    ///
    /// The operation is invoked at most `policy.max_attempts` times. The
    /// returned error is the classification of the last failure, with the
    /// number of attempts recorded in its context.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteFailure>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let failure = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let error = self.classifier.classify(&failure);
            if !policy.should_retry(attempts, &error) {
                if attempts > 1 || error.retryable {
                    warn!(kind = %error.kind, attempts, "giving up: {}", error.message);
                } else {
                    debug!(kind = %error.kind, "not retrying: {}", error.message);
                }
                return Err(error.add_context("attempts", attempts.to_string()));
            }

            let delay = policy.delay_for(attempts);
            debug!(
                kind = %error.kind,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after failure: {}",
                error.message
            );
            self.scheduler.sleep(delay).await;
        }
    }
}

impl fmt::Debug for RetryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryController").finish_non_exhaustive()
    }
}

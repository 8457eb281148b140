//! Timer scheduling for debounce, max-wait and backoff waits.
//!
//! All waiting done by the engine goes through [`Scheduler`], so the timing
//! model can be swapped out. [`TokioScheduler`] runs timers as Tokio tasks;
//! under a paused Tokio clock (`tokio::time::pause`) they follow virtual time,
//! which keeps tests deterministic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::SyncError;

/// A source of delayed work and sleeps.
pub trait Scheduler: Send + Sync {
    /// Runs `task` once `delay` has elapsed, unless the returned handle is
    /// cancelled first. The task must not run before `after` returns: callers
    /// schedule timers while holding their own state locks.
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;

    /// Completes once `delay` has elapsed.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Handle to a scheduled task.
///
/// Dropping the handle leaves the task scheduled; call [`TimerHandle::cancel`]
/// to stop it.
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Wraps a Tokio abort handle.
    pub fn from_abort_handle(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Cancels the task if it has not run yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Returns true once the task has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// [`Scheduler`] backed by a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler on the runtime of the calling context.
    pub fn current() -> Result<Self, SyncError> {
        Ok(Self::new(Handle::try_current()?))
    }

    /// Convenience for sharing as a trait object.
    pub fn shared(self) -> Arc<dyn Scheduler> {
        Arc::new(self)
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let join = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        TimerHandle::from_abort_handle(join.abort_handle())
    }

    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

//! Optimistic status updates with rollback.
//!
//! [`OptimisticCoordinator`] is the caller-facing side of the engine. An
//! optimistic update is shown to the user at once through the `on_apply`
//! callback, then synchronized through the [`UpdateQueue`]. If the remote
//! store rejects it for good, `on_rollback` restores the status the entity had
//! before the most recent unresolved optimistic update.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{ClassifiedError, Classify, ErrorClassifier, SyncError};
use crate::queue::{PendingInfo, QueueConfig, QueueObserver, StatusUpdateEntry, UpdateQueue};
use crate::remote::{StatusUpdater, StatusValue};
use crate::retry::RetryController;
use crate::scheduler::{Scheduler, TokioScheduler};

/// Called with the entity id and the status to show.
pub type StatusCallback<S> = Arc<dyn Fn(&str, &S) + Send + Sync>;

/// Called with the entity id and the terminal error.
pub type ErrorCallback = Arc<dyn Fn(&str, &ClassifiedError) + Send + Sync>;

/// Hooks into the caller's UI state.
pub struct OptimisticCallbacks<S> {
    on_apply: Option<StatusCallback<S>>,
    on_rollback: Option<StatusCallback<S>>,
    on_error: Option<ErrorCallback>,
}

impl<S> Default for OptimisticCallbacks<S> {
    fn default() -> Self {
        Self {
            on_apply: None,
            on_rollback: None,
            on_error: None,
        }
    }
}

impl<S> OptimisticCallbacks<S> {
    /// Creates an empty callback set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a status before the remote store confirms it.
    pub fn on_apply(mut self, f: impl Fn(&str, &S) + Send + Sync + 'static) -> Self {
        self.on_apply = Some(Arc::new(f));
        self
    }

    /// Restore the previous status after a terminal failure.
    pub fn on_rollback(mut self, f: impl Fn(&str, &S) + Send + Sync + 'static) -> Self {
        self.on_rollback = Some(Arc::new(f));
        self
    }

    /// Surface a terminal failure of a queued update.
    pub fn on_error(
        mut self,
        f: impl Fn(&str, &ClassifiedError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl<S> fmt::Debug for OptimisticCallbacks<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticCallbacks")
            .field("on_apply", &self.on_apply.is_some())
            .field("on_rollback", &self.on_rollback.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Rollback target for an entity with an unresolved optimistic update.
#[derive(Debug, Clone)]
struct PendingOptimistic<S> {
    previous: S,
    revision: u64,
}

/// Optimistic bookkeeping shared with the queue as its observer.
struct Tracker<S> {
    pending: Mutex<HashMap<String, PendingOptimistic<S>>>,
    callbacks: OptimisticCallbacks<S>,
}

impl<S: StatusValue> Tracker<S> {
    fn new(callbacks: OptimisticCallbacks<S>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            callbacks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingOptimistic<S>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, entity_id: &str, previous: S, revision: u64) {
        self.lock()
            .insert(entity_id.to_string(), PendingOptimistic { previous, revision });
    }

    /// Removes the entity's rollback target unless it belongs to a request
    /// newer than `revision`.
    fn resolve(&self, entity_id: &str, revision: u64) -> Option<S> {
        let mut pending = self.lock();
        match pending.get(entity_id) {
            Some(entry) if entry.revision <= revision => {
                pending.remove(entity_id).map(|entry| entry.previous)
            }
            _ => None,
        }
    }

    fn rollback(&self, entity_id: &str, revision: u64) {
        let Some(previous) = self.resolve(entity_id, revision) else {
            return;
        };
        warn!(entity_id, status = ?previous, "rolling back optimistic update");
        if let Some(on_rollback) = &self.callbacks.on_rollback {
            on_rollback(entity_id, &previous);
        }
    }

    fn apply(&self, entity_id: &str, status: &S) {
        if let Some(on_apply) = &self.callbacks.on_apply {
            on_apply(entity_id, status);
        }
    }

    /// Settles an outcome that bypassed the queue's observer.
    fn settle(&self, entity_id: &str, revision: u64, result: &Result<(), ClassifiedError>) {
        match result {
            Ok(()) => {
                self.resolve(entity_id, revision);
            }
            Err(_) => self.rollback(entity_id, revision),
        }
    }
}

impl<S: StatusValue> QueueObserver<S> for Tracker<S> {
    fn on_confirmed(&self, entry: &StatusUpdateEntry<S>) {
        if self.resolve(&entry.entity_id, entry.revision).is_some() {
            debug!(entity_id = %entry.entity_id, "optimistic update confirmed");
        }
    }

    fn on_failed(&self, entry: &StatusUpdateEntry<S>, error: &ClassifiedError) {
        self.rollback(&entry.entity_id, entry.revision);
        if let Some(on_error) = &self.callbacks.on_error {
            on_error(&entry.entity_id, error);
        }
    }
}

/// Caller-facing entry point of the sync engine.
///
/// Created with [`SyncEngineBuilder`]. Dropping the coordinator cancels all
/// pending work without rolling anything back.
pub struct OptimisticCoordinator<S: StatusValue> {
    queue: UpdateQueue<S>,
    tracker: Arc<Tracker<S>>,
}

impl<S: StatusValue> OptimisticCoordinator<S> {
    /// Starts building an engine.
    pub fn builder() -> SyncEngineBuilder<S> {
        SyncEngineBuilder::new()
    }

    /// Queues `status` for `entity_id` without touching UI state.
    pub fn debounced_update(&self, entity_id: &str, status: S) {
        self.queue.enqueue(entity_id, status);
    }

    /// Sends `status` for `entity_id` right away.
    ///
    /// Resolves an optimistic update still pending for the entity: success
    /// clears it, failure rolls it back.
    pub async fn immediate_update(&self, entity_id: &str, status: S) -> Result<(), ClassifiedError> {
        let revision = self.queue.reserve_revision();
        let result = self
            .queue
            .immediate_with_revision(entity_id.to_string(), status, revision)
            .await;
        self.tracker.settle(entity_id, revision, &result);
        result
    }

    /// Shows `status` at once, then queues it. `previous` is restored through
    /// `on_rollback` if the update fails for good.
    pub fn optimistic_update(&self, entity_id: &str, status: S, previous: S) {
        let revision = self.queue.reserve_revision();
        self.tracker.record(entity_id, previous, revision);
        self.tracker.apply(entity_id, &status);
        self.queue
            .enqueue_with_revision(entity_id.to_string(), status, revision);
    }

    /// Shows `status` at once, then sends it right away. On failure the
    /// update is rolled back and the error returned.
    pub async fn optimistic_immediate_update(
        &self,
        entity_id: &str,
        status: S,
        previous: S,
    ) -> Result<(), ClassifiedError> {
        let revision = self.queue.reserve_revision();
        self.tracker.record(entity_id, previous, revision);
        self.tracker.apply(entity_id, &status);
        let result = self
            .queue
            .immediate_with_revision(entity_id.to_string(), status, revision)
            .await;
        self.tracker.settle(entity_id, revision, &result);
        result
    }

    /// Submits everything pending and waits for the outcomes.
    pub async fn flush_updates(&self) {
        self.queue.flush().await;
    }

    /// Drops all pending updates and rollback targets. Nothing is rolled back.
    pub fn cancel_updates(&self) {
        self.queue.cancel();
        self.tracker.lock().clear();
    }

    /// Snapshot of pending queue work.
    pub fn pending_info(&self) -> PendingInfo {
        self.queue.pending_info()
    }

    /// Status `on_rollback` would restore for `entity_id`, if an optimistic
    /// update is unresolved.
    pub fn rollback_target(&self, entity_id: &str) -> Option<S> {
        self.tracker
            .lock()
            .get(entity_id)
            .map(|entry| entry.previous.clone())
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        self.queue.config()
    }
}

impl<S: StatusValue> Drop for OptimisticCoordinator<S> {
    fn drop(&mut self) {
        self.tracker.lock().clear();
    }
}

impl<S: StatusValue> fmt::Debug for OptimisticCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticCoordinator")
            .field("queue", &self.queue)
            .field("callbacks", &self.tracker.callbacks)
            .finish()
    }
}

/// Wires the remote updater, classifier, scheduler, settings and callbacks
/// into an [`OptimisticCoordinator`].
pub struct SyncEngineBuilder<S: StatusValue> {
    updater: Option<Arc<dyn StatusUpdater<S>>>,
    classifier: Option<Arc<dyn Classify>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    config: QueueConfig,
    callbacks: OptimisticCallbacks<S>,
}

impl<S: StatusValue> Default for SyncEngineBuilder<S> {
    fn default() -> Self {
        Self {
            updater: None,
            classifier: None,
            scheduler: None,
            config: QueueConfig::default(),
            callbacks: OptimisticCallbacks::default(),
        }
    }
}

impl<S: StatusValue> SyncEngineBuilder<S> {
    /// Starts a builder with default queue settings and no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote operation that persists statuses. Required.
    pub fn updater(mut self, updater: Arc<dyn StatusUpdater<S>>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Failure classifier. Defaults to [`ErrorClassifier`].
    pub fn classifier(mut self, classifier: Arc<dyn Classify>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Timer source. Defaults to a [`TokioScheduler`] on the current runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Queue settings. Validated by [`build`](Self::build).
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Display callbacks for optimistic updates.
    pub fn callbacks(mut self, callbacks: OptimisticCallbacks<S>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Fails if no updater was given, the configuration is invalid, or no
    /// scheduler was given outside a Tokio runtime.
    pub fn build(self) -> Result<OptimisticCoordinator<S>, SyncError> {
        self.config.validate()?;
        let updater = self.updater.ok_or(SyncError::Missing("status updater"))?;
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => TokioScheduler::current()?.shared(),
        };
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(ErrorClassifier::new()));

        let tracker = Arc::new(Tracker::new(self.callbacks));
        let observer: Arc<dyn QueueObserver<S>> = tracker.clone();
        let queue = UpdateQueue::with_observer(
            updater,
            RetryController::new(classifier, scheduler),
            self.config,
            observer,
        );

        Ok(OptimisticCoordinator { queue, tracker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, RemoteFailure};
    use crate::remote::ConcernStatus;
    use crate::simulation::FlakyUpdater;
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Apply(String, ConcernStatus),
        Rollback(String, ConcernStatus),
        Error(String, ErrorKind),
    }

    fn recording_callbacks(events: &Arc<Mutex<Vec<Event>>>) -> OptimisticCallbacks<ConcernStatus> {
        let apply = Arc::clone(events);
        let rollback = Arc::clone(events);
        let error = Arc::clone(events);
        OptimisticCallbacks::new()
            .on_apply(move |id, status| {
                apply.lock().unwrap().push(Event::Apply(id.to_string(), *status))
            })
            .on_rollback(move |id, status| {
                rollback
                    .lock()
                    .unwrap()
                    .push(Event::Rollback(id.to_string(), *status))
            })
            .on_error(move |id, err| {
                error
                    .lock()
                    .unwrap()
                    .push(Event::Error(id.to_string(), err.kind))
            })
    }

    struct Fixture {
        updater: Arc<FlakyUpdater<ConcernStatus>>,
        events: Arc<Mutex<Vec<Event>>>,
        engine: OptimisticCoordinator<ConcernStatus>,
    }

    fn fixture(updater: FlakyUpdater<ConcernStatus>) -> Fixture {
        let updater = Arc::new(updater);
        let events = Arc::new(Mutex::new(Vec::new()));
        let engine = OptimisticCoordinator::<ConcernStatus>::builder()
            .updater(updater.clone())
            .callbacks(recording_callbacks(&events))
            .build()
            .unwrap();
        Fixture {
            updater,
            events,
            engine,
        }
    }

    fn events(f: &Fixture) -> Vec<Event> {
        f.events.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_success_applies_without_rollback() {
        let f = fixture(FlakyUpdater::reliable());

        f.engine
            .optimistic_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview);
        assert_eq!(
            events(&f),
            vec![Event::Apply("c1".into(), ConcernStatus::Addressed)]
        );
        assert_eq!(f.engine.rollback_target("c1"), Some(ConcernStatus::ToReview));

        sleep(Duration::from_millis(600)).await;

        assert_eq!(f.updater.call_count(), 1);
        assert_eq!(f.engine.rollback_target("c1"), None);
        assert_eq!(events(&f).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_rolls_back_once() {
        let f = fixture(FlakyUpdater::failing(RemoteFailure::with_status(
            422,
            "invalid status transition",
        )));

        f.engine
            .optimistic_update("c1", ConcernStatus::Rejected, ConcernStatus::Addressed);
        f.engine.flush_updates().await;

        assert_eq!(f.updater.call_count(), 1);
        assert_eq!(
            events(&f),
            vec![
                Event::Apply("c1".into(), ConcernStatus::Rejected),
                Event::Rollback("c1".into(), ConcernStatus::Addressed),
                Event::Error("c1".into(), ErrorKind::Content),
            ]
        );
        assert_eq!(f.engine.rollback_target("c1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_targets_most_recent_previous() {
        let f = fixture(FlakyUpdater::failing(RemoteFailure::new("validation failed")));

        f.engine
            .optimistic_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview);
        f.engine
            .optimistic_update("c1", ConcernStatus::Rejected, ConcernStatus::Addressed);
        f.engine.flush_updates().await;

        let rollbacks: Vec<Event> = events(&f)
            .into_iter()
            .filter(|event| matches!(event, Event::Rollback(..)))
            .collect();
        assert_eq!(
            rollbacks,
            vec![Event::Rollback("c1".into(), ConcernStatus::Addressed)]
        );
        assert_eq!(
            f.updater.calls(),
            vec![("c1".to_string(), ConcernStatus::Rejected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_authentication_failure_rolls_back() {
        let f = fixture(FlakyUpdater::failing(RemoteFailure::with_status(
            401,
            "Unauthorized",
        )));

        let err = f
            .engine
            .optimistic_immediate_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(f.updater.call_count(), 1);
        // The error is returned to the caller, not reported through on_error.
        assert_eq!(
            events(&f),
            vec![
                Event::Apply("c1".into(), ConcernStatus::Addressed),
                Event::Rollback("c1".into(), ConcernStatus::ToReview),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_transient_failures_recover() {
        let f = fixture(FlakyUpdater::new(2, RemoteFailure::new("network error")));

        f.engine
            .optimistic_immediate_update("c1", ConcernStatus::Rejected, ConcernStatus::ToReview)
            .await
            .unwrap();

        assert_eq!(f.updater.call_count(), 3);
        assert_eq!(f.engine.rollback_target("c1"), None);
        assert_eq!(
            events(&f),
            vec![Event::Apply("c1".into(), ConcernStatus::Rejected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_update_resolves_pending_optimistic_entry() {
        let f = fixture(FlakyUpdater::reliable());

        f.engine
            .optimistic_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview);
        f.engine
            .immediate_update("c1", ConcernStatus::Rejected)
            .await
            .unwrap();

        assert_eq!(f.engine.rollback_target("c1"), None);
        assert_eq!(f.engine.pending_info().pending_count, 0);
        assert_eq!(
            f.updater.calls(),
            vec![("c1".to_string(), ConcernStatus::Rejected)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_outcome_keeps_newer_rollback_target() {
        let f = fixture(FlakyUpdater::reliable());

        f.engine
            .optimistic_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview);
        let revision = f.engine.queue.reserve_revision();
        f.engine
            .tracker
            .record("c1", ConcernStatus::Addressed, revision);

        // An outcome for an older revision must not clear the newer entry.
        assert_eq!(f.engine.tracker.resolve("c1", revision - 1), None);
        assert_eq!(f.engine.rollback_target("c1"), Some(ConcernStatus::Addressed));
        assert_eq!(
            f.engine.tracker.resolve("c1", revision),
            Some(ConcernStatus::Addressed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_updates_clears_without_rollback() {
        let f = fixture(FlakyUpdater::reliable());

        for id in ["c1", "c2", "c3"] {
            f.engine
                .optimistic_update(id, ConcernStatus::Addressed, ConcernStatus::ToReview);
        }
        assert_eq!(f.engine.pending_info().pending_count, 3);

        f.engine.cancel_updates();

        assert_eq!(f.engine.pending_info().pending_count, 0);
        assert_eq!(f.engine.rollback_target("c1"), None);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(f.updater.call_count(), 0);
        assert!(events(&f)
            .iter()
            .all(|event| matches!(event, Event::Apply(..))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_update_has_no_callbacks() {
        let f = fixture(FlakyUpdater::reliable());

        f.engine.debounced_update("c1", ConcernStatus::Addressed);
        f.engine.debounced_update("c1", ConcernStatus::Rejected);
        f.engine.flush_updates().await;

        assert!(events(&f).is_empty());
        assert_eq!(
            f.updater.calls(),
            vec![("c1".to_string(), ConcernStatus::Rejected)]
        );
    }

    #[tokio::test]
    async fn test_builder_requires_updater() {
        let result = SyncEngineBuilder::<ConcernStatus>::new().build();
        assert!(matches!(result, Err(SyncError::Missing(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let result = SyncEngineBuilder::<ConcernStatus>::new()
            .updater(Arc::new(FlakyUpdater::<ConcernStatus>::reliable()))
            .config(QueueConfig::default().with_batch_size(0))
            .build();
        assert!(matches!(result, Err(SyncError::InvalidSettings(_))));
    }

    #[test]
    fn test_builder_outside_runtime_fails() {
        let result = SyncEngineBuilder::<ConcernStatus>::new()
            .updater(Arc::new(FlakyUpdater::<ConcernStatus>::reliable()))
            .build();
        assert!(matches!(result, Err(SyncError::NoRuntime(_))));
    }
}

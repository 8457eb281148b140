//! Debounced, batching update queue.
//!
//! Requests for the same entity are coalesced: only the last status requested
//! between two submissions is sent. An entity is submitted once its debounce
//! timer elapses (no new request for `delay`) or its max-wait timer elapses
//! (`max_wait` after the first unsent request), whichever comes first.
//!
//! Submitted entries are drained in batches of up to `batch_size`, each call
//! running concurrently under the [`RetryController`]. Entries whose calls
//! exhaust the per-call budget with a kind the retry policy accepts are
//! re-enqueued with backoff by the outer `requeue` policy; anything else is
//! terminal and is reported to the [`QueueObserver`]. Drains always run as
//! detached tasks, never inside a caller's future.

pub mod entry;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::error::ClassifiedError;
use crate::remote::{StatusUpdater, StatusValue};
use crate::retry::RetryController;
use crate::scheduler::TimerHandle;

pub use entry::{PendingInfo, QueueConfig, StatusUpdateEntry};

/// Receives the final outcome of queued updates.
///
/// Callbacks run with no queue lock held and may call back into the queue.
pub trait QueueObserver<S: StatusValue>: Send + Sync {
    /// The remote store accepted `entry`.
    fn on_confirmed(&self, _entry: &StatusUpdateEntry<S>) {}

    /// `entry` failed terminally and was dropped from the queue.
    fn on_failed(&self, _entry: &StatusUpdateEntry<S>, _error: &ClassifiedError) {}
}

struct Timer {
    id: u64,
    handle: TimerHandle,
}

struct Slot<S> {
    entry: StatusUpdateEntry<S>,
    debounce: Option<Timer>,
    max_wait: Option<Timer>,
    fired: bool,
}

impl<S> Slot<S> {
    fn fired(entry: StatusUpdateEntry<S>) -> Self {
        Self {
            entry,
            debounce: None,
            max_wait: None,
            fired: true,
        }
    }

    fn clear_timers(&mut self) {
        for timer in [self.debounce.take(), self.max_wait.take()].into_iter().flatten() {
            timer.handle.cancel();
        }
    }
}

/// An entry waiting out the outer retry backoff.
struct Backoff<S> {
    entry: StatusUpdateEntry<S>,
    timer: Timer,
}

struct QueueState<S> {
    slots: HashMap<String, Slot<S>>,
    backoffs: HashMap<String, Backoff<S>>,
    /// Latest revision with outstanding work, per entity.
    latest: HashMap<String, u64>,
    processing: bool,
    epoch: u64,
    next_revision: u64,
    next_timer: u64,
}

impl<S> QueueState<S> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            backoffs: HashMap::new(),
            latest: HashMap::new(),
            processing: false,
            epoch: 0,
            next_revision: 0,
            next_timer: 0,
        }
    }

    fn timer_id(&mut self) -> u64 {
        self.next_timer += 1;
        self.next_timer
    }

    fn is_latest(&self, entry: &StatusUpdateEntry<S>) -> bool {
        self.latest.get(&entry.entity_id) == Some(&entry.revision)
    }

    fn forget(&mut self, entry: &StatusUpdateEntry<S>) {
        if self.is_latest(entry) {
            self.latest.remove(&entry.entity_id);
        }
    }

    /// Moves an entry out of backoff and marks it due, spending one outer retry.
    fn promote_backoff(&mut self, entity_id: &str) -> bool {
        let Some(backoff) = self.backoffs.remove(entity_id) else {
            return false;
        };
        backoff.timer.handle.cancel();
        let mut entry = backoff.entry;
        entry.retry_count += 1;
        self.slots.insert(entry.entity_id.clone(), Slot::fired(entry));
        true
    }

    /// Removes up to `limit` due entries, oldest first.
    fn take_fired(&mut self, limit: usize) -> Vec<StatusUpdateEntry<S>> {
        let mut due: Vec<(tokio::time::Instant, String)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.fired)
            .map(|(id, slot)| (slot.entry.enqueued_at, id.clone()))
            .collect();
        due.sort();
        due.truncate(limit.max(1));

        due.into_iter()
            .filter_map(|(_, id)| self.slots.remove(&id))
            .map(|slot| slot.entry)
            .collect()
    }

    fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .keys()
            .chain(self.backoffs.keys())
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

enum TimerKind {
    Debounce,
    MaxWait,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Debounce => write!(f, "debounce"),
            TimerKind::MaxWait => write!(f, "max_wait"),
        }
    }
}

struct QueueInner<S: StatusValue> {
    config: QueueConfig,
    updater: Arc<dyn StatusUpdater<S>>,
    retry: RetryController,
    observer: Option<Arc<dyn QueueObserver<S>>>,
    state: Mutex<QueueState<S>>,
    /// Signalled whenever a drain finishes or the queue is cancelled.
    settled: Notify,
}

impl<S: StatusValue> QueueInner<S> {
    fn lock(&self) -> MutexGuard<'_, QueueState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(
        self: &Arc<Self>,
        delay: Duration,
        task: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.retry.scheduler().after(
            delay,
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    task(&inner);
                }
            }),
        )
    }

    fn schedule_fire(
        self: &Arc<Self>,
        state: &mut QueueState<S>,
        entity_id: &str,
        kind: TimerKind,
        delay: Duration,
    ) -> Timer {
        let id = state.timer_id();
        let entity_id = entity_id.to_string();
        let handle = self.schedule(delay, move |inner| inner.fire(&entity_id, id, kind));
        Timer { id, handle }
    }

    fn enqueue(self: &Arc<Self>, entity_id: String, status: S, revision: u64) {
        let mut state = self.lock();
        if let Some(backoff) = state.backoffs.remove(&entity_id) {
            backoff.timer.handle.cancel();
            debug!(entity_id = %entity_id, "new request supersedes pending retry");
        }
        state.latest.insert(entity_id.clone(), revision);

        let fired = match state.slots.get_mut(&entity_id) {
            Some(slot) => {
                trace!(entity_id = %entity_id, ?status, revision, "coalescing update");
                slot.entry.coalesce(status, revision);
                slot.fired
            }
            None => {
                trace!(entity_id = %entity_id, ?status, revision, "queueing update");
                let entry = StatusUpdateEntry::new(entity_id.clone(), status, revision);
                state.slots.insert(
                    entity_id.clone(),
                    Slot {
                        entry,
                        debounce: None,
                        max_wait: None,
                        fired: false,
                    },
                );
                false
            }
        };
        // A due entry goes out with the latest status on the next drain.
        if fired {
            return;
        }

        let debounce =
            self.schedule_fire(&mut state, &entity_id, TimerKind::Debounce, self.config.delay);
        let needs_max_wait = state
            .slots
            .get(&entity_id)
            .is_some_and(|slot| slot.max_wait.is_none());
        let max_wait = needs_max_wait.then(|| {
            self.schedule_fire(&mut state, &entity_id, TimerKind::MaxWait, self.config.max_wait)
        });

        if let Some(slot) = state.slots.get_mut(&entity_id) {
            if let Some(previous) = slot.debounce.replace(debounce) {
                previous.handle.cancel();
            }
            if max_wait.is_some() {
                slot.max_wait = max_wait;
            }
        }
    }

    fn fire(self: &Arc<Self>, entity_id: &str, timer_id: u64, kind: TimerKind) {
        {
            let mut state = self.lock();
            let Some(slot) = state.slots.get_mut(entity_id) else {
                return;
            };
            let current = match kind {
                TimerKind::Debounce => &slot.debounce,
                TimerKind::MaxWait => &slot.max_wait,
            };
            if slot.fired || current.as_ref().map(|timer| timer.id) != Some(timer_id) {
                return;
            }
            slot.fired = true;
            slot.clear_timers();
        }
        debug!(entity_id, reason = %kind, "update due");
        self.request_drain();
    }

    fn request_drain(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        // Detached: the drain runs to completion even if nobody awaits it.
        let _ = self
            .retry
            .scheduler()
            .after(Duration::ZERO, Box::pin(async move { inner.drain().await }));
    }

    async fn drain(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.processing {
                // The active drain loops until no due entries remain.
                return;
            }
            state.processing = true;
        }

        loop {
            let (batch, epoch) = {
                let mut state = self.lock();
                let batch = state.take_fired(self.config.batch_size);
                if batch.is_empty() {
                    state.processing = false;
                    drop(state);
                    self.settled.notify_waiters();
                    return;
                }
                (batch, state.epoch)
            };

            debug!(size = batch.len(), "submitting batch");
            let outcomes = join_all(batch.into_iter().map(|entry| async move {
                let result = self.submit(&entry).await;
                (entry, result)
            }))
            .await;

            for (entry, result) in outcomes {
                self.settle(entry, result, epoch);
            }
        }
    }

    async fn submit(&self, entry: &StatusUpdateEntry<S>) -> Result<(), ClassifiedError> {
        let updater = &self.updater;
        self.retry
            .execute(&self.config.retry, || {
                updater.update_status(&entry.entity_id, entry.desired_status.clone())
            })
            .await
    }

    fn settle(
        self: &Arc<Self>,
        entry: StatusUpdateEntry<S>,
        result: Result<(), ClassifiedError>,
        epoch: u64,
    ) {
        let error = {
            let mut state = self.lock();
            if state.epoch != epoch {
                debug!(entity_id = %entry.entity_id, "discarding outcome of cancelled update");
                return;
            }

            match result {
                Ok(()) => {
                    state.forget(&entry);
                    None
                }
                Err(error) if !state.is_latest(&entry) => {
                    debug!(
                        entity_id = %entry.entity_id,
                        kind = %error.kind,
                        "failed update was superseded by a newer request"
                    );
                    return;
                }
                Err(error) => {
                    let attempts = entry.retry_count + 1;
                    // Kinds the caller excluded from retry are terminal at both layers.
                    let requeueable = self.config.retry.retryable_kinds.contains(&error.kind);
                    if requeueable && self.config.requeue.should_retry(attempts, &error) {
                        let delay = self.config.requeue.delay_for(attempts);
                        info!(
                            entity_id = %entry.entity_id,
                            kind = %error.kind,
                            retry = attempts,
                            delay_ms = delay.as_millis() as u64,
                            "re-enqueueing failed update"
                        );
                        let id = state.timer_id();
                        let entity_id = entry.entity_id.clone();
                        let handle = self.schedule(delay, move |inner| inner.requeue(&entity_id, id));
                        state.backoffs.insert(
                            entry.entity_id.clone(),
                            Backoff {
                                entry,
                                timer: Timer { id, handle },
                            },
                        );
                        return;
                    }

                    warn!(
                        entity_id = %entry.entity_id,
                        kind = %error.kind,
                        retries = entry.retry_count,
                        "dropping update after terminal failure: {}",
                        error.message
                    );
                    state.forget(&entry);
                    Some(error)
                }
            }
        };

        if let Some(observer) = &self.observer {
            match &error {
                None => observer.on_confirmed(&entry),
                Some(error) => observer.on_failed(&entry, error),
            }
        }
    }

    fn requeue(self: &Arc<Self>, entity_id: &str, timer_id: u64) {
        {
            let mut state = self.lock();
            let current = state.backoffs.get(entity_id).map(|backoff| backoff.timer.id);
            if current != Some(timer_id) || !state.promote_backoff(entity_id) {
                return;
            }
        }
        self.request_drain();
    }

    fn cancel(&self) {
        let discarded = {
            let mut state = self.lock();
            let discarded = state.slots.len() + state.backoffs.len();
            for (_, mut slot) in state.slots.drain() {
                slot.clear_timers();
            }
            for (_, backoff) in state.backoffs.drain() {
                backoff.timer.handle.cancel();
            }
            state.latest.clear();
            state.epoch += 1;
            discarded
        };
        if discarded > 0 {
            info!(discarded, "cancelled pending updates");
        }
        self.settled.notify_waiters();
    }
}

/// Debounced, batching queue of status updates.
///
/// Must be used from within a Tokio runtime context driving the configured
/// scheduler. Dropping the queue cancels everything still pending.
pub struct UpdateQueue<S: StatusValue> {
    inner: Arc<QueueInner<S>>,
}

impl<S: StatusValue> UpdateQueue<S> {
    /// Creates a queue without an outcome observer.
    pub fn new(
        updater: Arc<dyn StatusUpdater<S>>,
        retry: RetryController,
        config: QueueConfig,
    ) -> Self {
        Self::build(updater, retry, config, None)
    }

    /// Creates a queue reporting outcomes to `observer`.
    pub fn with_observer(
        updater: Arc<dyn StatusUpdater<S>>,
        retry: RetryController,
        config: QueueConfig,
        observer: Arc<dyn QueueObserver<S>>,
    ) -> Self {
        Self::build(updater, retry, config, Some(observer))
    }

    fn build(
        updater: Arc<dyn StatusUpdater<S>>,
        retry: RetryController,
        config: QueueConfig,
        observer: Option<Arc<dyn QueueObserver<S>>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                updater,
                retry,
                observer,
                state: Mutex::new(QueueState::new()),
                settled: Notify::new(),
            }),
        }
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Queues `status` for `entity_id` and returns the request's revision.
    /// Never blocks.
    pub fn enqueue(&self, entity_id: impl Into<String>, status: S) -> u64 {
        let revision = self.reserve_revision();
        self.enqueue_with_revision(entity_id.into(), status, revision);
        revision
    }

    /// Sends `status` for `entity_id` right away, dropping anything pending
    /// for that entity.
    pub async fn immediate(
        &self,
        entity_id: impl Into<String>,
        status: S,
    ) -> Result<(), ClassifiedError> {
        let revision = self.reserve_revision();
        self.immediate_with_revision(entity_id.into(), status, revision)
            .await
    }

    /// Submits every pending entry, including entries waiting on a retry,
    /// and returns once nothing is pending or in flight.
    pub async fn flush(&self) {
        let inner = &self.inner;
        loop {
            let settled = inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let (busy, has_work) = {
                let mut state = inner.lock();
                for slot in state.slots.values_mut() {
                    slot.clear_timers();
                    slot.fired = true;
                }
                let waiting: Vec<String> = state.backoffs.keys().cloned().collect();
                for entity_id in waiting {
                    state.promote_backoff(&entity_id);
                }
                (state.processing, !state.slots.is_empty())
            };

            // The drain runs detached, so dropping this future mid-batch
            // never strands the queue in the processing state.
            match (busy, has_work) {
                (false, false) => return,
                (false, true) => {
                    inner.request_drain();
                    settled.await;
                }
                (true, _) => settled.await,
            }
        }
    }

    /// Drops every pending entry and timer without submitting anything.
    /// Calls already in flight finish, but their outcomes are ignored.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Snapshot of pending work.
    pub fn pending_info(&self) -> PendingInfo {
        let state = self.inner.lock();
        let pending_entity_ids = state.pending_ids();
        PendingInfo {
            pending_count: pending_entity_ids.len(),
            is_processing: state.processing,
            pending_entity_ids,
        }
    }

    pub(crate) fn reserve_revision(&self) -> u64 {
        let mut state = self.inner.lock();
        state.next_revision += 1;
        state.next_revision
    }

    pub(crate) fn enqueue_with_revision(&self, entity_id: String, status: S, revision: u64) {
        self.inner.enqueue(entity_id, status, revision);
    }

    pub(crate) async fn immediate_with_revision(
        &self,
        entity_id: String,
        status: S,
        revision: u64,
    ) -> Result<(), ClassifiedError> {
        {
            let mut state = self.inner.lock();
            if let Some(mut slot) = state.slots.remove(&entity_id) {
                slot.clear_timers();
            }
            if let Some(backoff) = state.backoffs.remove(&entity_id) {
                backoff.timer.handle.cancel();
            }
            state.latest.insert(entity_id.clone(), revision);
        }

        debug!(entity_id = %entity_id, ?status, "sending immediate update");
        let entry = StatusUpdateEntry::new(entity_id, status, revision);
        let result = self.inner.submit(&entry).await;
        self.inner.lock().forget(&entry);
        result
    }
}

impl<S: StatusValue> Drop for UpdateQueue<S> {
    fn drop(&mut self) {
        self.inner.cancel();
    }
}

impl<S: StatusValue> fmt::Debug for UpdateQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_info())
            .finish()
    }
}

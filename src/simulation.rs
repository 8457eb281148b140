//! In-process simulation of a flaky remote store.
//!
//! [`FlakyUpdater`] stands in for the persistence service: it fails the first
//! few calls for each entity, then stores whatever it is sent. [`run`] drives
//! an engine against it the way an editor would (rapid optimistic flips on a
//! handful of concerns) and reports what reached the remote store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::error::{ErrorKind, RemoteFailure, SyncError};
use crate::optimistic::{OptimisticCallbacks, OptimisticCoordinator};
use crate::queue::QueueConfig;
use crate::remote::{ConcernStatus, StatusUpdater, StatusValue};

#[derive(Debug)]
struct FlakyState<S> {
    calls: Vec<(String, S)>,
    failures: HashMap<String, u32>,
    stored: BTreeMap<String, S>,
}

/// Remote store that fails the first `fail_first` calls per entity.
#[derive(Debug)]
pub struct FlakyUpdater<S> {
    fail_first: u32,
    failure: RemoteFailure,
    state: Mutex<FlakyState<S>>,
}

impl<S: StatusValue> FlakyUpdater<S> {
    /// Fails the first `fail_first` calls for each entity with `failure`.
    pub fn new(fail_first: u32, failure: RemoteFailure) -> Self {
        Self {
            fail_first,
            failure,
            state: Mutex::new(FlakyState {
                calls: Vec::new(),
                failures: HashMap::new(),
                stored: BTreeMap::new(),
            }),
        }
    }

    /// Never fails.
    pub fn reliable() -> Self {
        Self::new(0, RemoteFailure::new("unused"))
    }

    /// Always fails with `failure`.
    pub fn failing(failure: RemoteFailure) -> Self {
        Self::new(u32::MAX, failure)
    }

    fn lock(&self) -> MutexGuard<'_, FlakyState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an initial status without recording a call.
    pub fn seed(&self, entity_id: &str, status: S) {
        self.lock().stored.insert(entity_id.to_string(), status);
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<(String, S)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Status currently stored for `entity_id`.
    pub fn stored_status(&self, entity_id: &str) -> Option<S> {
        self.lock().stored.get(entity_id).cloned()
    }

    /// All stored statuses by entity id.
    pub fn stored(&self) -> BTreeMap<String, S> {
        self.lock().stored.clone()
    }
}

#[async_trait]
impl<S: StatusValue> StatusUpdater<S> for FlakyUpdater<S> {
    async fn update_status(&self, entity_id: &str, status: S) -> Result<(), RemoteFailure> {
        let mut state = self.lock();
        state.calls.push((entity_id.to_string(), status.clone()));

        let failed = state.failures.entry(entity_id.to_string()).or_insert(0);
        if *failed < self.fail_first {
            *failed += 1;
            return Err(self.failure.clone());
        }

        state.stored.insert(entity_id.to_string(), status);
        Ok(())
    }
}

/// What to simulate.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Number of concerns being edited.
    pub concerns: usize,
    /// Status changes per concern.
    pub flips: usize,
    /// Pause between rounds of changes.
    pub interval: Duration,
    /// Calls to fail per concern before the remote store recovers.
    pub fail_first: u32,
    /// Failure returned while failing.
    pub failure: RemoteFailure,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            concerns: 3,
            flips: 4,
            interval: Duration::from_millis(100),
            fail_first: 0,
            failure: RemoteFailure::new("network error"),
        }
    }
}

/// A terminal failure reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatedError {
    pub entity_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub concerns: usize,
    /// Optimistic updates requested.
    pub requests: usize,
    /// Calls that reached the remote store, failed ones included.
    pub remote_calls: usize,
    pub applied: usize,
    pub rollbacks: usize,
    pub errors: Vec<SimulatedError>,
    /// Whether the displayed statuses match the remote store.
    pub converged: bool,
    pub displayed: BTreeMap<String, ConcernStatus>,
    pub remote: BTreeMap<String, ConcernStatus>,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Observed {
    displayed: Mutex<BTreeMap<String, ConcernStatus>>,
    applied: AtomicUsize,
    rollbacks: AtomicUsize,
    errors: Mutex<Vec<SimulatedError>>,
}

impl Observed {
    fn displayed(&self) -> MutexGuard<'_, BTreeMap<String, ConcernStatus>> {
        self.displayed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(self: &Arc<Self>) -> OptimisticCallbacks<ConcernStatus> {
        let apply = Arc::clone(self);
        let rollback = Arc::clone(self);
        let error = Arc::clone(self);
        OptimisticCallbacks::new()
            .on_apply(move |id, status| {
                apply.displayed().insert(id.to_string(), *status);
                apply.applied.fetch_add(1, Ordering::SeqCst);
            })
            .on_rollback(move |id, status| {
                rollback.displayed().insert(id.to_string(), *status);
                rollback.rollbacks.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |id, err| {
                error
                    .errors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(SimulatedError {
                        entity_id: id.to_string(),
                        kind: err.kind,
                        message: err.message.clone(),
                    });
            })
    }
}

fn status_for_round(round: usize) -> ConcernStatus {
    if round % 2 == 0 {
        ConcernStatus::Addressed
    } else {
        ConcernStatus::Rejected
    }
}

/// Runs `scenario` against a [`FlakyUpdater`] with the given queue settings.
///
/// Every concern starts as `to_review` both locally and remotely. Each round
/// flips every concern optimistically, then waits `interval`. The engine is
/// flushed once all rounds are done.
pub async fn run(config: QueueConfig, scenario: &Scenario) -> Result<SimulationReport, SyncError> {
    let updater = Arc::new(FlakyUpdater::<ConcernStatus>::new(
        scenario.fail_first,
        scenario.failure.clone(),
    ));
    let observed = Arc::new(Observed::default());
    let ids: Vec<String> = (1..=scenario.concerns).map(|i| format!("c{i}")).collect();
    for id in &ids {
        updater.seed(id, ConcernStatus::ToReview);
        observed.displayed().insert(id.clone(), ConcernStatus::ToReview);
    }

    let engine = OptimisticCoordinator::<ConcernStatus>::builder()
        .updater(updater.clone())
        .config(config)
        .callbacks(observed.callbacks())
        .build()?;

    info!(
        concerns = scenario.concerns,
        flips = scenario.flips,
        fail_first = scenario.fail_first,
        "starting simulation"
    );
    let start = Instant::now();
    let mut requests = 0;
    for round in 0..scenario.flips {
        let next = status_for_round(round);
        for id in &ids {
            let previous = observed
                .displayed()
                .get(id)
                .copied()
                .unwrap_or(ConcernStatus::ToReview);
            engine.optimistic_update(id, next, previous);
            requests += 1;
        }
        if round + 1 < scenario.flips {
            tokio::time::sleep(scenario.interval).await;
        }
    }
    engine.flush_updates().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    drop(engine);

    let displayed = observed.displayed().clone();
    let remote = updater.stored();
    let errors = observed
        .errors
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    let report = SimulationReport {
        concerns: scenario.concerns,
        requests,
        remote_calls: updater.call_count(),
        applied: observed.applied.load(Ordering::SeqCst),
        rollbacks: observed.rollbacks.load(Ordering::SeqCst),
        errors,
        converged: displayed == remote,
        displayed,
        remote,
        elapsed_ms,
    };
    info!(
        remote_calls = report.remote_calls,
        rollbacks = report.rollbacks,
        converged = report.converged,
        "simulation finished"
    );
    Ok(report)
}

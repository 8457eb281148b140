//! concern-sync - status synchronization engine for proofreading concerns
//!
//! Reconciles rapid, possibly conflicting client-side status changes with a
//! remote store: requests are debounced and coalesced per entity, submitted in
//! batches under a classifier-driven retry policy, and shown optimistically
//! with rollback on terminal failure.
//!
//! ```no_run
//! use std::sync::Arc;
//! use concern_sync::{ConcernStatus, OptimisticCallbacks, OptimisticCoordinator};
//! use concern_sync::simulation::FlakyUpdater;
//!
//! # async fn demo() -> Result<(), concern_sync::SyncError> {
//! let engine = OptimisticCoordinator::<ConcernStatus>::builder()
//!     .updater(Arc::new(FlakyUpdater::<ConcernStatus>::reliable()))
//!     .callbacks(OptimisticCallbacks::<ConcernStatus>::new().on_rollback(|id, status| {
//!         println!("{id} reverted to {status}");
//!     }))
//!     .build()?;
//!
//! engine.optimistic_update("c1", ConcernStatus::Addressed, ConcernStatus::ToReview);
//! engine.flush_updates().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod optimistic;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod simulation;

pub use error::{ClassifiedError, Classify, ErrorClassifier, ErrorKind, RemoteFailure, SyncError};
pub use optimistic::{OptimisticCallbacks, OptimisticCoordinator, SyncEngineBuilder};
pub use queue::{PendingInfo, QueueConfig, QueueObserver, UpdateQueue};
pub use remote::{ConcernStatus, StatusUpdater, StatusValue};
pub use retry::{RetryController, RetryPolicy};
pub use scheduler::{Scheduler, TimerHandle, TokioScheduler};

//! Contract for the remote status store.
//!
//! The engine never talks to the network itself. Callers provide a
//! [`StatusUpdater`] that persists one entity's status, and the engine decides
//! when and how often to call it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteFailure;

/// Bounds for status values carried through the engine.
pub trait StatusValue: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> StatusValue for T where T: Clone + fmt::Debug + Send + Sync + 'static {}

/// Review status of a proofreading concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernStatus {
    /// The concern has not been looked at yet
    ToReview,
    /// The writer fixed the text
    Addressed,
    /// The writer dismissed the concern
    Rejected,
}

impl fmt::Display for ConcernStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcernStatus::ToReview => write!(f, "to_review"),
            ConcernStatus::Addressed => write!(f, "addressed"),
            ConcernStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Remote operation that persists an entity's status.
///
/// Implementations must be idempotent: retries and re-enqueues can submit the
/// same final status more than once.
#[async_trait]
pub trait StatusUpdater<S: StatusValue>: Send + Sync {
    /// Persist `status` for `entity_id`.
    async fn update_status(&self, entity_id: &str, status: S) -> Result<(), RemoteFailure>;
}

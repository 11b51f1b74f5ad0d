//! Cache-aside query coordination: dedup lock, loading status, request handles.

pub mod coordinator;
pub mod entry;
pub mod keys;
pub mod protocol;

use crate::queue::QueueError;
use crate::store::StoreError;

pub use self::coordinator::{CacheAsideCoordinator, CoordinatorSettings};
pub use self::entry::{CacheEntry, EntryStatus, RequestHandle};
pub use self::keys::QueryKeys;
pub use self::protocol::{CallerTier, PollOutcome, SubmitOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("keyword must be non-empty and at most {max} characters", max = keys::MAX_KEYWORD_CHARS)]
    InvalidKeyword,
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The key was claimed but the job could not be enqueued. The claim expires on its own.
    #[error("query could not be dispatched, retry shortly: {0}")]
    Retryable(#[source] QueueError),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Retryable(_) => true,
            SubmitError::Store(e) => e.is_connectivity(),
            SubmitError::InvalidKeyword => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("malformed request id")]
    InvalidRequestId,
    #[error(transparent)]
    Store(#[from] StoreError),
}

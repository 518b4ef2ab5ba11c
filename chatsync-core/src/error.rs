//! Error taxonomy for store and sync operations

use thiserror::Error;

/// Failure of a `ConversationStore` call, classified for the failover policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Timeout or a temporary hiccup; worth retrying
    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    /// The privileged channel is gone for good
    #[error("privileged store channel invalidated: {0}")]
    ChannelInvalidated(String),

    /// Neither backend could serve the call
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The embedded store rejected the call
    #[error("local store error: {0}")]
    Local(String),

    /// A backend answered with something the caller did not ask for
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Fatal errors downgrade the session to the local store permanently.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::ChannelInvalidated(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[cfg(feature = "rusqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Local(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Local(format!("record encoding: {e}"))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure of a resolve/attach/sync cycle.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The platform adapter could not read the page
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The task driving a pending creation went away before finishing
    #[error("creation task aborted: {0}")]
    Aborted(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StoreError::ChannelInvalidated("gone".into()).is_fatal());
        assert!(!StoreError::Transient("slow".into()).is_fatal());
        assert!(StoreError::Transient("slow".into()).is_transient());
        assert!(!StoreError::Unavailable("x".into()).is_transient());
    }

    #[test]
    fn test_sync_error_wraps_store_error() {
        let err: SyncError = StoreError::Unavailable("both down".into()).into();
        assert_eq!(err.to_string(), "storage unavailable: both down");
    }
}

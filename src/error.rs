//! Error types for jobtrack-sync

use thiserror::Error;

use crate::models::RecordType;

/// Errors surfaced to callers of the sync engine.
///
/// Network-class conditions never show up here from `create`/`update`/
/// `delete`; those resolve as "saved locally" instead.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Rejected by server ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("No {record_type} with id {id}")]
    NotFound { record_type: RecordType, id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("A replay is already in flight")]
    ReplayInFlight,

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected { status, message } => SyncError::Validation { status, message },
            other => SyncError::Remote(other),
        }
    }
}

/// Failures of a single RemoteAPI call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("API request failed with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether this failure means "could not reach a working backend"
    /// rather than "the backend refused this payload".
    pub fn is_network_class(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Server { status, .. } | RemoteError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// LocalStore read/write failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage quota exceeded writing {key} ({needed} bytes, {available} available)")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("IO error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("Corrupt value under {key}: {message}")]
    Corrupt { key: String, message: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_not_network_class() {
        let rejected = RemoteError::Rejected {
            status: 400,
            message: "jobTitle is required".into(),
        };
        assert!(!rejected.is_network_class());
        assert!(RemoteError::Timeout.is_network_class());
        assert!(RemoteError::Server {
            status: 503,
            message: String::new()
        }
        .is_network_class());
    }

    #[test]
    fn test_rejection_maps_to_validation() {
        let err: SyncError = RemoteError::Rejected {
            status: 422,
            message: "bad".into(),
        }
        .into();
        assert!(matches!(err, SyncError::Validation { status: 422, .. }));

        let err: SyncError = RemoteError::Connect("refused".into()).into();
        assert!(matches!(err, SyncError::Remote(RemoteError::Connect(_))));
    }
}

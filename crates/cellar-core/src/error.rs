//! Error types shared by every storage backend

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A single schema violation reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Dotted path to the offending field ("" for the record itself)
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Classification of failures reported by the storage engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageErrorKind {
    /// Opening the database failed
    Open,
    /// An upgrade could not proceed because older connections are still open
    Blocked,
    /// The environment refused access to storage
    Denied,
    /// Requested version is lower than the stored one
    Version,
    /// The transaction was aborted
    Aborted,
    /// Operation issued in the wrong transaction state or mode
    InvalidState,
    /// Write attempted in a readonly transaction
    ReadOnly,
    /// Value or key is not storable
    Data,
    /// Storage quota exceeded
    Quota,
    /// Connection already closed
    Closed,
    /// Anything else the backend reports
    Backend,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageErrorKind::Open => "open",
            StorageErrorKind::Blocked => "blocked",
            StorageErrorKind::Denied => "denied",
            StorageErrorKind::Version => "version",
            StorageErrorKind::Aborted => "aborted",
            StorageErrorKind::InvalidState => "invalid state",
            StorageErrorKind::ReadOnly => "read only",
            StorageErrorKind::Data => "data",
            StorageErrorKind::Quota => "quota exceeded",
            StorageErrorKind::Closed => "closed",
            StorageErrorKind::Backend => "backend",
        };
        f.write_str(name)
    }
}

/// Errors returned by collection and database operations.
///
/// Cloneable so one failed open can be handed to every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Record rejected by the collection's validator
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<Issue>),

    /// Key collision or unique index violation
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Failure reported by the storage engine
    #[error("storage error ({kind}): {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    /// Unknown collection, or missing record for an operation that needs one
    #[error("not found: {0}")]
    NotFound(String),

    /// Record could not be converted to or from its stored form
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database configuration is inconsistent
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation abandoned through its cancellation token
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        StoreError::Storage {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::storage(StorageErrorKind::InvalidState, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::storage(StorageErrorKind::Aborted, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::storage(StorageErrorKind::Data, message)
    }

    /// Storage kind, if this is an engine failure.
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            StoreError::Storage { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

fn join_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

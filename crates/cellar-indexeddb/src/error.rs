//! Error types for the IndexedDB engine

use cellar_core::{StorageErrorKind, StoreError};
use thiserror::Error;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::DomException;

/// Result type for IndexedDB operations
pub type Result<T> = std::result::Result<T, IndexedDbError>;

/// Errors raised by the browser's IndexedDB implementation
#[derive(Debug, Error)]
pub enum IndexedDbError {
    /// IndexedDB is not available in this environment
    #[error("IndexedDB not available: {0}")]
    NotAvailable(String),

    /// A `DOMException` (or JS error) reported by a request or transaction
    #[error("{name}: {message}")]
    Dom { name: String, message: String },

    /// Open or delete waiting on connections that never closed
    #[error("blocked: {0}")]
    Blocked(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JavaScript value conversion error
    #[error("JS conversion error: {0}")]
    JsValue(String),
}

impl From<JsValue> for IndexedDbError {
    fn from(val: JsValue) -> Self {
        if let Some(dom) = val.dyn_ref::<DomException>() {
            return IndexedDbError::Dom {
                name: dom.name(),
                message: dom.message(),
            };
        }
        if let Some(err) = val.dyn_ref::<js_sys::Error>() {
            return IndexedDbError::Dom {
                name: String::from(err.name()),
                message: String::from(err.message()),
            };
        }
        let msg = js_sys::JSON::stringify(&val)
            .map(String::from)
            .unwrap_or_else(|_| format!("{:?}", val));
        IndexedDbError::JsValue(msg)
    }
}

/// Map onto the core error taxonomy by `DOMException` name.
impl From<IndexedDbError> for StoreError {
    fn from(err: IndexedDbError) -> Self {
        match err {
            IndexedDbError::NotAvailable(msg) => StoreError::storage(StorageErrorKind::Open, msg),
            IndexedDbError::Blocked(msg) => StoreError::storage(StorageErrorKind::Blocked, msg),
            IndexedDbError::Json(e) => StoreError::Serialization(e.to_string()),
            IndexedDbError::JsValue(msg) => StoreError::storage(StorageErrorKind::Backend, msg),
            IndexedDbError::Dom { name, message } => {
                let kind = match name.as_str() {
                    "ConstraintError" => return StoreError::Constraint(message),
                    "NotFoundError" => return StoreError::NotFound(message),
                    "QuotaExceededError" => StorageErrorKind::Quota,
                    "AbortError" => StorageErrorKind::Aborted,
                    "InvalidStateError" | "TransactionInactiveError" | "InvalidAccessError" => {
                        StorageErrorKind::InvalidState
                    }
                    "ReadOnlyError" => StorageErrorKind::ReadOnly,
                    "DataError" | "DataCloneError" | "TypeError" => StorageErrorKind::Data,
                    "VersionError" => StorageErrorKind::Version,
                    "SecurityError" => StorageErrorKind::Denied,
                    _ => StorageErrorKind::Backend,
                };
                StoreError::storage(kind, format!("{}: {}", name, message))
            }
        }
    }
}

/// Convert a rejected JS value straight into a [`StoreError`].
pub(crate) fn js_error(val: JsValue) -> StoreError {
    IndexedDbError::from(val).into()
}

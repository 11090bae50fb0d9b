//! Sync error types.
//!
//! [`OperationError`] is scoped to a single queued operation and always ends
//! up in the result ledger. [`SyncError`] fails a whole request.

use crate::store::StoreError;

/// Why a single operation could not be applied.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("invalid updatedAt for {collection}/{id}: {value}")]
    InvalidBasisTimestamp {
        collection: String,
        id: String,
        value: String,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl OperationError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        OperationError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => OperationError::NotFound { collection, id },
            other => OperationError::Store(other),
        }
    }
}

/// Errors that fail an entire sync request.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The request is malformed; nothing was applied.
    #[error("invalid sync request: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The store failed outside of per-operation processing.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn invalid(problem: impl Into<String>) -> Self {
        SyncError::Validation(vec![problem.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_operation_not_found() {
        let err: OperationError = StoreError::not_found("sites", "600545").into();
        assert!(matches!(err, OperationError::NotFound { .. }));
        assert_eq!(err.to_string(), "document not found: sites/600545");
    }

    #[test]
    fn test_store_failure_stays_transparent() {
        let err: OperationError = StoreError::Unavailable("connection reset".to_string()).into();
        assert_eq!(err.to_string(), "store unavailable: connection reset");
    }

    #[test]
    fn test_validation_message_lists_problems() {
        let err = SyncError::Validation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "invalid sync request: a; b");
    }
}

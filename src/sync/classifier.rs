//! Decides what to do with one queued operation.
//!
//! Staleness is judged on a single scalar: the `updatedAt` the client based
//! its edit on versus the `updatedAt` (or `createdAt`) currently stored. A
//! strictly older basis is a conflict. Equal timestamps are not, and an
//! update without a basis is applied as-is.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::OperationError;
use super::operation::{Operation, OperationType};
use crate::clock::{format_timestamp, parse_timestamp};
use crate::store::{Document, StoredDocument};

/// The outcome of classifying an operation.
#[derive(Debug)]
pub enum Classification {
    /// Hand the operation to the applier.
    Apply,
    /// The server copy is newer than the client's basis.
    Conflict(ConflictDetail),
    /// The operation cannot be applied at all.
    Reject(OperationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    UpdateConflict,
}

/// Both sides of a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetail {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    /// The data the client proposed.
    pub local_data: Document,
    /// The document as currently stored.
    pub server_data: Document,
    pub client_updated_at: String,
    pub server_updated_at: String,
}

/// The timestamp a stored document was last edited at, as far as clients
/// can tell: `updatedAt`, falling back to `createdAt`.
pub fn basis_timestamp(data: &Document) -> Option<DateTime<Utc>> {
    data.get("updatedAt")
        .and_then(parse_timestamp)
        .or_else(|| data.get("createdAt").and_then(parse_timestamp))
}

/// Classifies `op` against the current state of its target.
///
/// `existing` is ignored for creates.
pub fn classify(op: &Operation, existing: Option<&StoredDocument>) -> Classification {
    let id = op.document_id.as_deref().unwrap_or_default();

    match op.kind {
        OperationType::Create => Classification::Apply,
        OperationType::Delete => match existing {
            Some(_) => Classification::Apply,
            None => Classification::Reject(OperationError::not_found(&op.collection, id)),
        },
        OperationType::Update => {
            let Some(existing) = existing else {
                return Classification::Reject(OperationError::not_found(&op.collection, id));
            };

            let Some(client_value) = op.data.get("updatedAt") else {
                return Classification::Apply;
            };

            let Some(client_updated_at) = parse_timestamp(client_value) else {
                return Classification::Reject(OperationError::InvalidBasisTimestamp {
                    collection: op.collection.clone(),
                    id: id.to_string(),
                    value: client_value.to_string(),
                });
            };

            match basis_timestamp(&existing.data) {
                Some(server_updated_at) if client_updated_at < server_updated_at => {
                    Classification::Conflict(ConflictDetail {
                        kind: ConflictKind::UpdateConflict,
                        local_data: op.data.clone(),
                        server_data: existing.data.clone(),
                        client_updated_at: format_timestamp(client_updated_at),
                        server_updated_at: format_timestamp(server_updated_at),
                    })
                }
                _ => Classification::Apply,
            }
        }
    }
}

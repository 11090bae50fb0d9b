//! Per-operation outcome ledger returned to the device.
//!
//! Every submitted operation lands in exactly one bucket, keyed by its
//! `offlineId`.

use serde::Serialize;

use super::classifier::ConflictDetail;
use super::error::OperationError;
use super::operation::{Operation, OperationType};

/// An operation that was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessEntry {
    pub offline_id: String,
    pub server_id: String,
    pub collection: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
}

/// An operation held back because the server copy is newer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub offline_id: String,
    pub collection: String,
    pub document_id: String,
    pub conflict: ConflictDetail,
}

/// An operation that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub offline_id: String,
    pub collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub error: String,
}

/// Where a single operation ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Applied(SuccessEntry),
    Conflicted(ConflictEntry),
    Errored(ErrorEntry),
}

impl LedgerEntry {
    pub fn applied(op: &Operation, server_id: String) -> Self {
        LedgerEntry::Applied(SuccessEntry {
            offline_id: op.offline_id.clone(),
            server_id,
            collection: op.collection.clone(),
            kind: op.kind,
        })
    }

    pub fn conflicted(op: &Operation, conflict: ConflictDetail) -> Self {
        LedgerEntry::Conflicted(ConflictEntry {
            offline_id: op.offline_id.clone(),
            collection: op.collection.clone(),
            document_id: op.document_id.clone().unwrap_or_default(),
            conflict,
        })
    }

    pub fn errored(op: &Operation, error: &OperationError) -> Self {
        LedgerEntry::Errored(ErrorEntry {
            offline_id: op.offline_id.clone(),
            collection: op.collection.clone(),
            document_id: op.document_id.clone(),
            error: error.to_string(),
        })
    }
}

/// The three outcome buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResults {
    pub successful: Vec<SuccessEntry>,
    pub conflicts: Vec<ConflictEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl SyncResults {
    pub fn record(&mut self, entry: LedgerEntry) {
        match entry {
            LedgerEntry::Applied(e) => self.successful.push(e),
            LedgerEntry::Conflicted(e) => self.conflicts.push(e),
            LedgerEntry::Errored(e) => self.errors.push(e),
        }
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary {
            total: self.successful.len() + self.conflicts.len() + self.errors.len(),
            successful: self.successful.len(),
            conflicts: self.conflicts.len(),
            errors: self.errors.len(),
        }
    }
}

/// Counts per bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub total: usize,
    pub successful: usize,
    pub conflicts: usize,
    pub errors: usize,
}

/// Response body of a sync submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub message: String,
    /// Server time the batch completed, also written to the checkpoint.
    pub timestamp: String,
    pub results: SyncResults,
    pub summary: SyncSummary,
}

//! Offline sync core.
//!
//! A device uploads the operations it queued while offline. Each operation
//! is classified against current store state ([`classifier`]), applied when
//! it passes ([`applier`]), and reported in a per-operation ledger
//! ([`ledger`]). [`SyncService`] drives a whole batch and records the
//! caller's [`checkpoint`]; [`resolution`] re-applies conflicts a client
//! has decided how to settle.

pub mod applier;
pub mod checkpoint;
pub mod classifier;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod operation;
pub mod resolution;

pub use applier::Applier;
pub use checkpoint::SyncCheckpoint;
pub use classifier::{classify, Classification};
pub use coordinator::{ChangeFeed, ChangeQuery, SyncService, SyncStatus};
pub use error::{OperationError, SyncError};
pub use ledger::{LedgerEntry, SyncOutcome, SyncResults, SyncSummary};
pub use operation::{Operation, OperationType, SyncRequest, SyncSession};
pub use resolution::{ConflictRecord, ResolutionMode, ResolutionReport, ResolveRequest};

use serde::Deserialize;

/// Collection holding one checkpoint document per user.
pub const CHECKPOINT_COLLECTION: &str = "syncCheckpoints";

/// Collection holding reported conflicts until they are resolved.
pub const CONFLICT_COLLECTION: &str = "syncConflicts";

/// Tunables for the sync endpoints.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSettings {
    /// Collections clients may write to and pull from.
    pub collections: Vec<String>,
    /// Largest batch accepted by a single sync request.
    pub max_operations: usize,
    /// Largest page returned by the change feed.
    pub max_changes: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            collections: ["sites", "fuelLogs", "maintenanceLogs", "equipment"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_operations: 500,
            max_changes: 1000,
        }
    }
}

impl SyncSettings {
    /// Whether clients may touch `collection`.
    pub fn allows(&self, collection: &str) -> bool {
        collection != CHECKPOINT_COLLECTION
            && collection != CONFLICT_COLLECTION
            && self.collections.iter().any(|c| c == collection)
    }
}

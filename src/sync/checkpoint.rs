//! Per-user sync checkpoint.
//!
//! One document per user in [`CHECKPOINT_COLLECTION`], merged after every
//! batch. Counters describe the latest batch only; two devices of the same
//! user syncing concurrently overwrite each other's counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ledger::SyncSummary;
use super::CHECKPOINT_COLLECTION;
use crate::clock::{format_timestamp, parse_timestamp};
use crate::store::{Document, EntityStore, StoreError};

/// The persisted outcome of a user's most recent sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub last_sync_timestamp: Option<Value>,
    #[serde(default)]
    pub successful_operations: u64,
    #[serde(default)]
    pub conflicted_operations: u64,
    #[serde(default)]
    pub failed_operations: u64,
}

impl SyncCheckpoint {
    /// Loads the checkpoint for `user_id`, if one was ever written.
    pub async fn load(
        store: &dyn EntityStore,
        user_id: &str,
    ) -> Result<Option<Self>, StoreError> {
        let Some(stored) = store.get(CHECKPOINT_COLLECTION, user_id).await? else {
            return Ok(None);
        };

        let mut data = stored.data;
        data.entry("userId")
            .or_insert_with(|| Value::String(user_id.to_string()));

        serde_json::from_value(Value::Object(data))
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                collection: CHECKPOINT_COLLECTION.to_string(),
                id: user_id.to_string(),
                source,
            })
    }

    /// Merges this batch's outcome into the user's checkpoint.
    ///
    /// `app_version` is only written when the device reported one, so an
    /// older value survives batches that omit it.
    pub async fn record(
        store: &dyn EntityStore,
        user_id: &str,
        device_id: &str,
        app_version: Option<&str>,
        completed_at: DateTime<Utc>,
        summary: SyncSummary,
    ) -> Result<(), StoreError> {
        let mut patch = Document::new();
        patch.insert("userId".to_string(), Value::from(user_id));
        patch.insert("deviceId".to_string(), Value::from(device_id));
        if let Some(version) = app_version {
            patch.insert("appVersion".to_string(), Value::from(version));
        }
        patch.insert(
            "lastSyncTimestamp".to_string(),
            Value::String(format_timestamp(completed_at)),
        );
        patch.insert(
            "successfulOperations".to_string(),
            Value::from(summary.successful as u64),
        );
        patch.insert(
            "conflictedOperations".to_string(),
            Value::from(summary.conflicts as u64),
        );
        patch.insert(
            "failedOperations".to_string(),
            Value::from(summary.errors as u64),
        );

        store.set_merge(CHECKPOINT_COLLECTION, user_id, patch).await
    }

    /// When the last batch completed.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync_timestamp.as_ref().and_then(parse_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn summary(successful: usize, conflicts: usize, errors: usize) -> SyncSummary {
        SyncSummary {
            total: successful + conflicts + errors,
            successful,
            conflicts,
            errors,
        }
    }

    #[tokio::test]
    async fn test_load_missing_checkpoint() {
        let store = MemoryStore::new();
        assert!(SyncCheckpoint::load(&store, "tech-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_overwrites_counts_and_keeps_app_version() {
        let store = MemoryStore::new();
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

        SyncCheckpoint::record(&store, "tech-1", "tablet", Some("2.0.0"), first, summary(5, 1, 1))
            .await
            .unwrap();
        SyncCheckpoint::record(&store, "tech-1", "phone", None, second, summary(2, 0, 0))
            .await
            .unwrap();

        let checkpoint = SyncCheckpoint::load(&store, "tech-1").await.unwrap().unwrap();
        assert_eq!(checkpoint.device_id.as_deref(), Some("phone"));
        assert_eq!(checkpoint.app_version.as_deref(), Some("2.0.0"));
        assert_eq!(checkpoint.last_sync(), Some(second));
        assert_eq!(checkpoint.successful_operations, 2);
        assert_eq!(checkpoint.conflicted_operations, 0);
        assert_eq!(checkpoint.failed_operations, 0);
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let store = MemoryStore::new();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        SyncCheckpoint::record(&store, "tech-1", "tablet", Some("2.0.0"), at, summary(1, 2, 3))
            .await
            .unwrap();

        let stored = store
            .get(CHECKPOINT_COLLECTION, "tech-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Value::Object(stored.data),
            json!({
                "userId": "tech-1",
                "deviceId": "tablet",
                "appVersion": "2.0.0",
                "lastSyncTimestamp": "2024-05-01T08:00:00.000Z",
                "successfulOperations": 1,
                "conflictedOperations": 2,
                "failedOperations": 3
            })
        );
    }
}

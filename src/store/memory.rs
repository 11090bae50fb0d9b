//! In-process document store.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    last_writer, merge_into, ChangeBound, Document, EntityStore, StoreError, StoredDocument,
};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    data: Document,
    updated_at: DateTime<Utc>,
}

/// Documents kept in memory, grouped by collection.
///
/// A single write lock is held across each read-merge-write, which gives the
/// same per-document serialization the persistent adapter gets from SQLite.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty store stamping writes with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamping writes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Write times are kept at millisecond precision, the same as the
    /// persistent adapter, so cursors built from them compare exactly.
    fn write_time(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Number of documents in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|entry| StoredDocument {
                id: id.to_string(),
                data: entry.data.clone(),
                updated_at: entry.updated_at,
            }))
    }

    async fn set(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError> {
        let updated_at = self.write_time();
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), Entry { data, updated_at });
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError> {
        let updated_at = self.write_time();
        let mut collections = self.collections.write().await;
        let entry = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;

        merge_into(&mut entry.data, patch);
        entry.updated_at = updated_at;
        Ok(())
    }

    async fn set_merge(
        &self,
        collection: &str,
        id: &str,
        patch: Document,
    ) -> Result<(), StoreError> {
        let updated_at = self.write_time();
        let mut collections = self.collections.write().await;
        let entry = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| Entry {
                data: Document::new(),
                updated_at,
            });

        merge_into(&mut entry.data, patch);
        entry.updated_at = updated_at;
        Ok(())
    }

    async fn changed_since(
        &self,
        collection: &str,
        bound: Option<ChangeBound>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut changed: Vec<StoredDocument> = docs
            .iter()
            .filter(|(id, entry)| {
                bound
                    .as_ref()
                    .map_or(true, |bound| bound.admits(entry.updated_at, id))
            })
            .map(|(id, entry)| StoredDocument {
                id: id.clone(),
                data: entry.data.clone(),
                updated_at: entry.updated_at,
            })
            .collect();

        changed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        changed.truncate(limit);
        Ok(changed)
    }

    async fn count_changed_since(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        exclude_writer: &str,
    ) -> Result<usize, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map_or(0, |docs| {
            docs.values()
                .filter(|entry| since.map_or(true, |since| entry.updated_at > since))
                .filter(|entry| last_writer(&entry.data) != Some(exclude_writer))
                .count()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn setup() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (store, _clock) = setup();
        assert!(store.get("sites", "600545").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_mints_id_and_writes_it() {
        let (store, _clock) = setup();

        let id = store
            .create("fuelLogs", doc(json!({"currentLevel": 80})))
            .await
            .unwrap();

        let stored = store.get("fuelLogs", &id).await.unwrap().unwrap();
        assert_eq!(stored.data["id"], json!(id));
        assert_eq!(stored.data["currentLevel"], json!(80));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (store, _clock) = setup();

        let err = store
            .update("sites", "nope", doc(json!({"name": "X"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_merges_and_restamps() {
        let (store, clock) = setup();
        store
            .set("sites", "600545", doc(json!({"name": "North", "tanks": 2})))
            .await
            .unwrap();

        clock.advance(Duration::minutes(1));
        store
            .update("sites", "600545", doc(json!({"name": "North Ridge"})))
            .await
            .unwrap();

        let stored = store.get("sites", "600545").await.unwrap().unwrap();
        assert_eq!(
            Value::Object(stored.data),
            json!({"name": "North Ridge", "tanks": 2})
        );
        assert_eq!(stored.updated_at, clock.now());
    }

    #[tokio::test]
    async fn test_set_merge_creates_then_merges() {
        let (store, _clock) = setup();

        store
            .set_merge("syncCheckpoints", "u1", doc(json!({"deviceId": "d1", "appVersion": "1.0"})))
            .await
            .unwrap();
        store
            .set_merge("syncCheckpoints", "u1", doc(json!({"deviceId": "d2"})))
            .await
            .unwrap();

        let stored = store.get("syncCheckpoints", "u1").await.unwrap().unwrap();
        assert_eq!(
            Value::Object(stored.data),
            json!({"deviceId": "d2", "appVersion": "1.0"})
        );
    }

    #[tokio::test]
    async fn test_changed_since_orders_and_filters() {
        let (store, clock) = setup();
        let start = clock.now();

        store.set("fuelLogs", "b", doc(json!({}))).await.unwrap();
        clock.advance(Duration::seconds(10));
        store.set("fuelLogs", "a", doc(json!({}))).await.unwrap();
        clock.advance(Duration::seconds(10));
        store.set("fuelLogs", "c", doc(json!({}))).await.unwrap();

        let all = store.changed_since("fuelLogs", None, 10).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        let later = store
            .changed_since("fuelLogs", Some(ChangeBound::After(start)), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = later.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let limited = store.changed_since("fuelLogs", None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store
            .changed_since("sites", None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_changed_since_resumes_inside_equal_timestamps() {
        let (store, clock) = setup();
        let at = clock.now();
        for id in ["a", "b", "c"] {
            store.set("sites", id, doc(json!({}))).await.unwrap();
        }

        let rest = store
            .changed_since("sites", Some(ChangeBound::AfterKey(at, "a".into())), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = rest.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_count_changed_since_skips_own_writes() {
        let (store, clock) = setup();
        let start = clock.now();

        store
            .set("fuelLogs", "mine", doc(json!({"createdBy": "tech-1"})))
            .await
            .unwrap();
        clock.advance(Duration::seconds(1));
        store
            .set("fuelLogs", "theirs", doc(json!({"createdBy": "tech-2"})))
            .await
            .unwrap();
        store
            .set(
                "fuelLogs",
                "deleted",
                doc(json!({"createdBy": "tech-1", "isActive": false, "deletedBy": "tech-2"})),
            )
            .await
            .unwrap();

        assert_eq!(
            store.count_changed_since("fuelLogs", None, "tech-1").await.unwrap(),
            2
        );
        assert_eq!(
            store
                .count_changed_since("fuelLogs", Some(start), "tech-2")
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store.count_changed_since("sites", None, "tech-1").await.unwrap(),
            0
        );
    }
}

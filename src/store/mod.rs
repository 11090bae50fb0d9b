//! Entity store adapters.
//!
//! The sync core only sees documents through the [`EntityStore`] trait: a
//! key-value store addressed by `(collection, id)` where every document is a
//! JSON object and every write is stamped with the store's own write time.
//!
//! Two adapters are provided:
//! - [`MemoryStore`] keeps everything in process (tests, embedding).
//! - [`SqliteStore`] persists documents as JSON rows through `sqlx`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{init_db, SqliteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A JSON object as stored in a collection.
pub type Document = Map<String, Value>;

/// A document together with its storage metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
    /// When the store last wrote this document.
    pub updated_at: DateTime<Utc>,
}

/// Errors raised by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt document {collection}/{id}: {source}")]
    Corrupt {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt timestamp on {collection}/{id}: {value}")]
    CorruptTimestamp {
        collection: String,
        id: String,
        value: String,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Document store contract used by the sync core.
///
/// Writes to one document are serialized by the adapter; nothing spans more
/// than one document.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetches a document, `Ok(None)` if absent.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Writes a document, replacing whatever was there.
    async fn set(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError>;

    /// Shallow-merges `patch` over an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist.
    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError>;

    /// Shallow-merges `patch` over a document, creating it if absent.
    ///
    /// Fields named in `patch` are replaced; all other fields persist.
    async fn set_merge(&self, collection: &str, id: &str, patch: Document)
        -> Result<(), StoreError>;

    /// Lists documents past `bound` (all documents when `None`), ordered by
    /// `(updated_at, id)`, at most `limit` of them.
    async fn changed_since(
        &self,
        collection: &str,
        bound: Option<ChangeBound>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Counts documents written after `since` whose [`last_writer`] is not
    /// `exclude_writer`.
    async fn count_changed_since(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        exclude_writer: &str,
    ) -> Result<usize, StoreError> {
        let changed = self
            .changed_since(collection, since.map(ChangeBound::After), usize::MAX)
            .await?;
        Ok(changed
            .iter()
            .filter(|doc| last_writer(&doc.data) != Some(exclude_writer))
            .count())
    }

    /// Mints a fresh document id for `collection`.
    fn mint_id(&self, _collection: &str) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Creates a document under a freshly minted id and returns the id.
    ///
    /// The id is also written into the document's `id` field.
    async fn create(&self, collection: &str, mut data: Document) -> Result<String, StoreError> {
        let id = self.mint_id(collection);
        data.insert("id".to_string(), Value::String(id.clone()));
        self.set(collection, &id, data).await?;
        Ok(id)
    }
}

/// Lower bound on a collection's `(updated_at, id)` change order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeBound {
    /// Written strictly after this time.
    After(DateTime<Utc>),
    /// Written at or after this time.
    From(DateTime<Utc>),
    /// Strictly past this `(updated_at, id)` position.
    AfterKey(DateTime<Utc>, String),
}

impl ChangeBound {
    /// Whether a document at `(updated_at, id)` lies past the bound.
    pub fn admits(&self, updated_at: DateTime<Utc>, id: &str) -> bool {
        match self {
            ChangeBound::After(at) => updated_at > *at,
            ChangeBound::From(at) => updated_at >= *at,
            ChangeBound::AfterKey(at, after_id) => {
                updated_at > *at || (updated_at == *at && id > after_id.as_str())
            }
        }
    }
}

/// Who wrote a document last, judged from its provenance fields.
///
/// `deletedBy` for an inactive document, else `updatedBy`, else `createdBy`.
/// JSON nulls count as absent.
pub fn last_writer(data: &Document) -> Option<&str> {
    let field = |name: &str| data.get(name).filter(|v| !v.is_null());
    let deleted = data.get("isActive") == Some(&Value::Bool(false));
    deleted
        .then(|| field("deletedBy"))
        .flatten()
        .or_else(|| field("updatedBy"))
        .or_else(|| field("createdBy"))
        .and_then(Value::as_str)
}

/// Overwrites the fields of `base` named in `patch`.
pub(crate) fn merge_into(base: &mut Document, patch: Document) {
    for (key, value) in patch {
        base.insert(key, value);
    }
}

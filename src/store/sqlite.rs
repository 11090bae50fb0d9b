//! SQLite-backed document store.
//!
//! Each document is one row of the `documents` table, keyed by
//! `(collection, id)`, with the body stored as JSON text. Store write times
//! are kept as RFC 3339 strings with a fixed millisecond format so they sort
//! lexically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::{merge_into, ChangeBound, Document, EntityStore, StoreError, StoredDocument};
use crate::clock::{format_timestamp, Clock, SystemClock};

/// Opens (creating if needed) the database at `path` and runs migrations.
pub async fn init_db(path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    data: String,
    updated_at: String,
}

/// Document store on top of a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn hydrate(collection: &str, row: DocumentRow) -> Result<StoredDocument, StoreError> {
        let data: Document =
            serde_json::from_str(&row.data).map_err(|source| StoreError::Corrupt {
                collection: collection.to_string(),
                id: row.id.clone(),
                source,
            })?;

        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| StoreError::CorruptTimestamp {
                collection: collection.to_string(),
                id: row.id.clone(),
                value: row.updated_at.clone(),
            })?;

        Ok(StoredDocument {
            id: row.id,
            data,
            updated_at,
        })
    }

    fn encode(collection: &str, id: &str, data: &Document) -> Result<String, StoreError> {
        serde_json::to_string(data).map_err(|source| StoreError::Corrupt {
            collection: collection.to_string(),
            id: id.to_string(),
            source,
        })
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::hydrate(collection, row)).transpose()
    }

    async fn set(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError> {
        let body = Self::encode(collection, id, &data)?;
        let now = format_timestamp(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id)
            DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Document) -> Result<(), StoreError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::not_found(collection, id));
        };

        let mut data = Self::hydrate(collection, row)?.data;
        merge_into(&mut data, patch);
        let body = Self::encode(collection, id, &data)?;

        sqlx::query("UPDATE documents SET data = ?, updated_at = ? WHERE collection = ? AND id = ?")
            .bind(&body)
            .bind(format_timestamp(self.clock.now()))
            .bind(collection)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_merge(
        &self,
        collection: &str,
        id: &str,
        patch: Document,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, data, updated_at FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut data = match row {
            Some(row) => Self::hydrate(collection, row)?.data,
            None => Document::new(),
        };
        merge_into(&mut data, patch);
        let body = Self::encode(collection, id, &data)?;
        let now = format_timestamp(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (collection, id)
            DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn changed_since(
        &self,
        collection: &str,
        bound: Option<ChangeBound>,
        limit: usize,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let (filter, at, after_id) = match bound {
            None => ("", None, None),
            Some(ChangeBound::After(at)) => ("AND updated_at > ?", Some(format_timestamp(at)), None),
            Some(ChangeBound::From(at)) => ("AND updated_at >= ?", Some(format_timestamp(at)), None),
            Some(ChangeBound::AfterKey(at, id)) => (
                "AND (updated_at > ? OR (updated_at = ? AND id > ?))",
                Some(format_timestamp(at)),
                Some(id),
            ),
        };
        let sql = format!(
            "SELECT id, data, updated_at FROM documents WHERE collection = ? {} ORDER BY updated_at, id LIMIT ?",
            filter
        );

        let mut query = sqlx::query_as::<Sqlite, DocumentRow>(&sql).bind(collection);
        if let Some(at) = &at {
            query = query.bind(at.clone());
        }
        if let Some(id) = after_id {
            query = query.bind(at.clone()).bind(id);
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|row| Self::hydrate(collection, row))
            .collect()
    }

    async fn count_changed_since(
        &self,
        collection: &str,
        since: Option<DateTime<Utc>>,
        exclude_writer: &str,
    ) -> Result<usize, StoreError> {
        let since = since.map(format_timestamp);

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM documents
            WHERE collection = ? AND (? IS NULL OR updated_at > ?)
              AND COALESCE(
                    CASE WHEN json_type(data, '$.isActive') = 'false'
                         THEN json_extract(data, '$.deletedBy') END,
                    json_extract(data, '$.updatedBy'),
                    json_extract(data, '$.createdBy')
                  ) IS NOT ?
            "#,
        )
        .bind(collection)
        .bind(since.clone())
        .bind(since)
        .bind(exclude_writer)
        .fetch_one(&self.pool)
        .await?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}

//! Sync session coordinator.
//!
//! [`SyncService`] is built once at startup with its store and clock and
//! shared by every request. A batch is processed strictly in submission
//! order, one store round-trip at a time, because later operations are
//! classified against state earlier ones may have changed. A failing
//! operation never stops the rest of the batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use super::applier::Applier;
use super::checkpoint::SyncCheckpoint;
use super::classifier::{classify, Classification};
use super::error::{OperationError, SyncError};
use super::ledger::{LedgerEntry, SyncOutcome, SyncResults};
use super::operation::{Operation, OperationType, SyncRequest, SyncSession};
use super::resolution::record_conflict;
use super::SyncSettings;
use crate::clock::{format_timestamp, parse_timestamp, Clock};
use crate::identity::AuthUser;
use crate::store::{ChangeBound, Document, EntityStore, StoredDocument};

/// Entry point for every sync operation.
#[derive(Clone)]
pub struct SyncService {
    pub(super) store: Arc<dyn EntityStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) applier: Applier,
    settings: SyncSettings,
}

impl SyncService {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>, settings: SyncSettings) -> Self {
        let applier = Applier::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            applier,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Validates and processes one uploaded batch.
    ///
    /// Only a malformed request is an error; every per-operation problem is
    /// reported in the returned ledger.
    pub async fn sync(&self, user: &AuthUser, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        let session = request.into_session(user.clone(), &self.settings)?;
        Ok(self.run_session(session).await)
    }

    /// Processes an already validated session and records the checkpoint.
    pub async fn run_session(&self, session: SyncSession) -> SyncOutcome {
        tracing::info!(
            "Sync from {} ({}) on device {}: {} operation(s), client watermark {:?}",
            session.user.user_id,
            session.user.role,
            session.device_id,
            session.operations.len(),
            session.last_sync_timestamp.map(format_timestamp)
        );

        let mut results = SyncResults::default();
        for op in &session.operations {
            let entry = self.process(&session, op).await;
            results.record(entry);
        }

        let completed_at = self.clock.now();
        let summary = results.summary();

        if let Err(e) = SyncCheckpoint::record(
            self.store.as_ref(),
            &session.user.user_id,
            &session.device_id,
            session.app_version.as_deref(),
            completed_at,
            summary,
        )
        .await
        {
            tracing::error!(
                "Failed to record sync checkpoint for {}: {}",
                session.user.user_id,
                e
            );
        }

        tracing::info!(
            "Sync for {} finished: {} applied, {} conflicted, {} failed",
            session.user.user_id,
            summary.successful,
            summary.conflicts,
            summary.errors
        );

        SyncOutcome {
            message: "Sync completed".to_string(),
            timestamp: format_timestamp(completed_at),
            results,
            summary,
        }
    }

    async fn process(&self, session: &SyncSession, op: &Operation) -> LedgerEntry {
        tracing::debug!(
            "Processing {} {} {}/{}",
            op.offline_id,
            op.kind,
            op.collection,
            op.document_id.as_deref().unwrap_or("<new>")
        );

        let existing = match self.load_target(op).await {
            Ok(existing) => existing,
            Err(e) => return self.errored(op, e),
        };

        match classify(op, existing.as_ref()) {
            Classification::Apply => match self.applier.apply(&session.user, op).await {
                Ok(server_id) => LedgerEntry::applied(op, server_id),
                Err(e) => self.errored(op, e),
            },
            Classification::Conflict(detail) => {
                tracing::warn!(
                    "Conflict on {}/{} for {}: client basis {} is older than server {}",
                    op.collection,
                    op.document_id.as_deref().unwrap_or_default(),
                    op.offline_id,
                    detail.client_updated_at,
                    detail.server_updated_at
                );
                record_conflict(
                    self.store.as_ref(),
                    self.clock.as_ref(),
                    session,
                    op,
                    &detail,
                )
                .await;
                LedgerEntry::conflicted(op, detail)
            }
            Classification::Reject(e) => self.errored(op, e),
        }
    }

    async fn load_target(&self, op: &Operation) -> Result<Option<StoredDocument>, OperationError> {
        match (op.kind, op.document_id.as_deref()) {
            (OperationType::Create, _) | (_, None) => Ok(None),
            (_, Some(id)) => Ok(self.store.get(&op.collection, id).await?),
        }
    }

    fn errored(&self, op: &Operation, error: OperationError) -> LedgerEntry {
        tracing::warn!("Operation {} failed: {}", op.offline_id, error);
        LedgerEntry::errored(op, &error)
    }

    /// Reports the caller's last checkpoint and how much changed since.
    pub async fn status(&self, user: &AuthUser) -> Result<SyncStatus, SyncError> {
        let checkpoint = SyncCheckpoint::load(self.store.as_ref(), &user.user_id).await?;
        let since = checkpoint.as_ref().and_then(SyncCheckpoint::last_sync);

        let mut pending_changes = 0;
        for collection in self
            .settings
            .collections
            .iter()
            .filter(|c| self.settings.allows(c))
        {
            pending_changes += self
                .store
                .count_changed_since(collection, since, &user.user_id)
                .await?;
        }

        Ok(match checkpoint {
            Some(checkpoint) => SyncStatus {
                status: SyncState::Synced,
                last_sync: checkpoint.last_sync().map(format_timestamp),
                device_id: checkpoint.device_id,
                app_version: checkpoint.app_version,
                last_sync_stats: SyncStats {
                    successful: checkpoint.successful_operations,
                    conflicts: checkpoint.conflicted_operations,
                    failed: checkpoint.failed_operations,
                },
                pending_changes,
            },
            None => SyncStatus {
                status: SyncState::NeverSynced,
                last_sync: None,
                device_id: None,
                app_version: None,
                last_sync_stats: SyncStats::default(),
                pending_changes,
            },
        })
    }

    /// Lists documents written after a watermark, oldest first.
    ///
    /// Pages are ordered by `(updatedAt, collection, documentId)`. A client
    /// pages by passing back `nextCursor`; when both `cursor` and `since`
    /// are given, the cursor wins.
    pub async fn changes(&self, query: ChangeQuery) -> Result<ChangeFeed, SyncError> {
        let since = match query.since.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_query_timestamp(raw).ok_or_else(|| {
                SyncError::invalid(format!("since is not a timestamp: {}", raw))
            })?),
        };

        let cursor = match query.cursor.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(ChangeCursor::parse(raw).ok_or_else(|| {
                SyncError::invalid(format!("cursor is malformed: {}", raw))
            })?),
        };

        let collections: Vec<String> = match query.collections.as_deref() {
            None => self.settings.collections.clone(),
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect(),
        };

        let forbidden: Vec<String> = collections
            .iter()
            .filter(|c| !self.settings.allows(c))
            .map(|c| format!("collection {:?} is not syncable", c))
            .collect();
        if !forbidden.is_empty() {
            return Err(SyncError::Validation(forbidden));
        }

        let limit = query
            .limit
            .unwrap_or(self.settings.max_changes)
            .clamp(1, self.settings.max_changes.max(1));

        // Fetching one extra row per collection is enough to tell whether
        // the merged page was cut short.
        let mut changes = Vec::new();
        for collection in &collections {
            let bound = match &cursor {
                Some(cursor) => Some(cursor.bound_for(collection)),
                None => since.map(ChangeBound::After),
            };
            let docs = self
                .store
                .changed_since(collection, bound, limit.saturating_add(1))
                .await?;
            changes.extend(docs.into_iter().map(|doc| (collection.clone(), doc)));
        }

        changes.sort_by(|(ca, a), (cb, b)| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| ca.cmp(cb))
                .then_with(|| a.id.cmp(&b.id))
        });
        let has_more = changes.len() > limit;
        changes.truncate(limit);

        tracing::debug!(
            "Change feed since {:?} cursor {:?}: {} document(s), has_more={}",
            since,
            cursor,
            changes.len(),
            has_more
        );

        let next_cursor = match changes.last() {
            Some((collection, doc)) => Some(
                ChangeCursor {
                    updated_at: doc.updated_at,
                    collection: collection.clone(),
                    document_id: doc.id.clone(),
                }
                .encode(),
            ),
            None => cursor.as_ref().map(ChangeCursor::encode),
        };

        Ok(ChangeFeed {
            timestamp: format_timestamp(self.clock.now()),
            since: since.map(format_timestamp),
            changes: changes
                .into_iter()
                .map(|(collection, doc)| ChangedDocument {
                    collection,
                    document_id: doc.id,
                    updated_at: format_timestamp(doc.updated_at),
                    data: doc.data,
                })
                .collect(),
            next_cursor,
            has_more,
        })
    }
}

/// Resume position in the change feed: the last delivered
/// `(updatedAt, collection, documentId)`, encoded as
/// `<updatedAt>|<collection>|<documentId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCursor {
    pub updated_at: DateTime<Utc>,
    pub collection: String,
    pub document_id: String,
}

impl ChangeCursor {
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}",
            format_timestamp(self.updated_at),
            self.collection,
            self.document_id
        )
    }

    /// Document ids may contain `|`; collection names may not.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '|');
        let updated_at = parse_query_timestamp(parts.next()?)?;
        let collection = parts.next().filter(|c| !c.is_empty())?;
        let document_id = parts.next()?;
        Some(Self {
            updated_at,
            collection: collection.to_string(),
            document_id: document_id.to_string(),
        })
    }

    /// Where `collection` resumes, given the feed's collection tie-break.
    fn bound_for(&self, collection: &str) -> ChangeBound {
        match collection.cmp(self.collection.as_str()) {
            Ordering::Less => ChangeBound::After(self.updated_at),
            Ordering::Equal => ChangeBound::AfterKey(self.updated_at, self.document_id.clone()),
            Ordering::Greater => ChangeBound::From(self.updated_at),
        }
    }
}

fn parse_query_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(&Value::String(raw.to_string())).or_else(|| {
        raw.parse::<i64>()
            .ok()
            .and_then(|millis| parse_timestamp(&Value::from(millis)))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NeverSynced,
    Synced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub successful: u64,
    pub conflicts: u64,
    pub failed: u64,
}

/// Response body of the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: SyncState,
    pub last_sync: Option<String>,
    pub device_id: Option<String>,
    pub app_version: Option<String>,
    pub last_sync_stats: SyncStats,
    pub pending_changes: usize,
}

/// Query parameters of the change feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeQuery {
    pub since: Option<String>,
    /// `nextCursor` from a previous page.
    pub cursor: Option<String>,
    /// Comma-separated collection names.
    pub collections: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedDocument {
    pub collection: String,
    pub document_id: String,
    pub updated_at: String,
    pub data: Document,
}

/// Response body of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeed {
    pub timestamp: String,
    pub since: Option<String>,
    pub changes: Vec<ChangedDocument>,
    /// Pass back as `cursor` to continue after the last document.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

//! Conflict records and their resolution.
//!
//! Every conflict reported by a sync batch is persisted in
//! [`CONFLICT_COLLECTION`] under `<userId>:<offlineId>`, holding both sides
//! as they were at detection time. A later resolve request names the
//! conflict by its `offlineId` and picks a side:
//!
//! - `local` re-applies the client's proposed data,
//! - `server` keeps the stored document and only closes the record,
//! - `manual` applies client-supplied merged data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::classifier::ConflictDetail;
use super::coordinator::SyncService;
use super::error::{OperationError, SyncError};
use super::operation::{Operation, SyncSession};
use super::CONFLICT_COLLECTION;
use crate::clock::{format_timestamp, Clock};
use crate::identity::AuthUser;
use crate::store::{Document, EntityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// How the client chose to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    Local,
    Server,
    Manual,
}

impl ResolutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ResolutionMode::Local),
            "server" => Some(ResolutionMode::Server),
            "manual" => Some(ResolutionMode::Manual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMode::Local => "local",
            ResolutionMode::Server => "server",
            ResolutionMode::Manual => "manual",
        }
    }
}

/// A persisted conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub user_id: String,
    pub device_id: String,
    pub offline_id: String,
    pub collection: String,
    pub document_id: String,
    pub local_data: Document,
    pub server_data: Document,
    pub client_updated_at: String,
    pub server_updated_at: String,
    pub detected_at: String,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl ConflictRecord {
    /// Document id of the record for `offline_id` raised by `user_id`.
    pub fn key(user_id: &str, offline_id: &str) -> String {
        format!("{}:{}", user_id, offline_id)
    }

    fn into_document(self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Document::new()),
        }
    }
}

/// Persists a freshly detected conflict as pending.
///
/// A failure here is logged and otherwise ignored: the conflict is still
/// reported to the device, it just cannot be resolved through the server.
pub(crate) async fn record_conflict(
    store: &dyn EntityStore,
    clock: &dyn Clock,
    session: &SyncSession,
    op: &Operation,
    detail: &ConflictDetail,
) {
    let record = ConflictRecord {
        user_id: session.user.user_id.clone(),
        device_id: session.device_id.clone(),
        offline_id: op.offline_id.clone(),
        collection: op.collection.clone(),
        document_id: op.document_id.clone().unwrap_or_default(),
        local_data: detail.local_data.clone(),
        server_data: detail.server_data.clone(),
        client_updated_at: detail.client_updated_at.clone(),
        server_updated_at: detail.server_updated_at.clone(),
        detected_at: format_timestamp(clock.now()),
        status: ConflictStatus::Pending,
        resolution: None,
        resolved_at: None,
        resolved_by: None,
    };
    let key = ConflictRecord::key(&record.user_id, &record.offline_id);

    match store.get(CONFLICT_COLLECTION, &key).await {
        Ok(Some(previous))
            if replaces_pending_from_other_device(&previous.data, &record.device_id) =>
        {
            tracing::warn!(
                "Conflict {} from device {} replaces a pending conflict raised by device {}",
                key,
                record.device_id,
                previous.data.get("deviceId").and_then(serde_json::Value::as_str).unwrap_or("<unknown>")
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to read existing conflict {}: {}", key, e),
    }

    let written = match record.into_document() {
        Ok(data) => store.set(CONFLICT_COLLECTION, &key, data).await,
        Err(source) => Err(StoreError::Corrupt {
            collection: CONFLICT_COLLECTION.to_string(),
            id: key.clone(),
            source,
        }),
    };
    if let Err(e) = written {
        tracing::error!("Failed to record conflict {}: {}", key, e);
    }
}

/// Whether `previous` is a still-pending conflict recorded for a device
/// other than `device_id`. Conflicts are keyed per user, so two devices
/// reusing an `offlineId` share one record.
fn replaces_pending_from_other_device(previous: &Document, device_id: &str) -> bool {
    previous.get("status").and_then(Value::as_str) == Some("pending")
        && previous.get("deviceId").and_then(Value::as_str) != Some(device_id)
}

/// One resolution as uploaded by a device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResolution {
    pub operation_id: Option<String>,
    pub resolution: Option<String>,
    pub resolved_data: Option<Value>,
}

/// Body of a resolve request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub conflicts: Option<Vec<RawResolution>>,
    /// When set, only conflicts raised by this device are resolved.
    pub device_id: Option<String>,
}

/// A validated resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub operation_id: String,
    pub mode: ResolutionMode,
    pub resolved_data: Option<Value>,
}

impl ResolveRequest {
    /// Checks the shape of the request; item-level failures such as an
    /// unknown conflict are reported per item later.
    pub fn validate(self) -> Result<Vec<Resolution>, SyncError> {
        let raw = match self.conflicts {
            Some(list) if !list.is_empty() => list,
            _ => return Err(SyncError::invalid("conflicts must be a non-empty array")),
        };

        let mut problems = Vec::new();
        let mut resolutions = Vec::with_capacity(raw.len());
        for (index, item) in raw.into_iter().enumerate() {
            let operation_id = item.operation_id.filter(|id| !id.trim().is_empty());
            if operation_id.is_none() {
                problems.push(format!("conflicts[{}]: operationId is required", index));
            }

            let mode = match item.resolution.as_deref() {
                Some(r) => {
                    let mode = ResolutionMode::parse(r);
                    if mode.is_none() {
                        problems.push(format!(
                            "conflicts[{}]: unknown resolution {:?}",
                            index, r
                        ));
                    }
                    mode
                }
                None => {
                    problems.push(format!("conflicts[{}]: resolution is required", index));
                    None
                }
            };

            if let (Some(operation_id), Some(mode)) = (operation_id, mode) {
                resolutions.push(Resolution {
                    operation_id,
                    mode,
                    resolved_data: item.resolved_data,
                });
            }
        }

        if problems.is_empty() {
            Ok(resolutions)
        } else {
            Err(SyncError::Validation(problems))
        }
    }
}

/// Why a single resolution failed.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("conflict not found")]
    UnknownConflict,

    #[error("conflict already resolved")]
    AlreadyResolved,

    #[error("resolvedData must be an object for manual resolution")]
    MissingResolvedData,

    #[error("conflict was raised by device {0}")]
    OtherDevice(String),

    #[error(transparent)]
    Apply(#[from] OperationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Resolved,
    Failed,
}

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub operation_id: String,
    pub status: ResolutionStatus,
    pub resolution: ResolutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of a resolve request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionReport {
    pub results: Vec<ResolutionResult>,
}

impl SyncService {
    /// Settles previously reported conflicts owned by `user`, in order.
    pub async fn resolve_conflicts(
        &self,
        user: &AuthUser,
        request: ResolveRequest,
    ) -> Result<ResolutionReport, SyncError> {
        let device_id = request
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty());
        let resolutions = request.validate()?;
        tracing::info!(
            "Resolving {} conflict(s) for {}",
            resolutions.len(),
            user.user_id
        );

        let mut report = ResolutionReport::default();
        for resolution in resolutions {
            let result = match self
                .resolve_one(user, device_id.as_deref(), &resolution)
                .await
            {
                Ok(record) => ResolutionResult {
                    operation_id: resolution.operation_id,
                    status: ResolutionStatus::Resolved,
                    resolution: resolution.mode,
                    collection: Some(record.collection),
                    document_id: Some(record.document_id),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(
                        "Resolution of {} for {} failed: {}",
                        resolution.operation_id,
                        user.user_id,
                        e
                    );
                    ResolutionResult {
                        operation_id: resolution.operation_id,
                        status: ResolutionStatus::Failed,
                        resolution: resolution.mode,
                        collection: None,
                        document_id: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.results.push(result);
        }

        Ok(report)
    }

    async fn resolve_one(
        &self,
        user: &AuthUser,
        device_id: Option<&str>,
        resolution: &Resolution,
    ) -> Result<ConflictRecord, ResolutionError> {
        let key = ConflictRecord::key(&user.user_id, &resolution.operation_id);
        let stored = self
            .store
            .get(CONFLICT_COLLECTION, &key)
            .await?
            .ok_or(ResolutionError::UnknownConflict)?;

        let record: ConflictRecord = serde_json::from_value(Value::Object(stored.data))
            .map_err(|source| StoreError::Corrupt {
                collection: CONFLICT_COLLECTION.to_string(),
                id: key.clone(),
                source,
            })?;

        if record.status == ConflictStatus::Resolved {
            return Err(ResolutionError::AlreadyResolved);
        }
        if let Some(device_id) = device_id {
            if device_id != record.device_id {
                return Err(ResolutionError::OtherDevice(record.device_id));
            }
        }

        match resolution.mode {
            ResolutionMode::Local => {
                self.applier
                    .update(
                        user,
                        &record.collection,
                        &record.document_id,
                        record.local_data.clone(),
                    )
                    .await?;
            }
            ResolutionMode::Server => {}
            ResolutionMode::Manual => {
                let Some(Value::Object(merged)) = &resolution.resolved_data else {
                    return Err(ResolutionError::MissingResolvedData);
                };
                self.applier
                    .update(user, &record.collection, &record.document_id, merged.clone())
                    .await?;
            }
        }

        let mut closed = Document::new();
        closed.insert("status".to_string(), Value::from("resolved"));
        closed.insert(
            "resolution".to_string(),
            Value::from(resolution.mode.as_str()),
        );
        closed.insert(
            "resolvedAt".to_string(),
            Value::String(format_timestamp(self.clock.now())),
        );
        closed.insert("resolvedBy".to_string(), Value::from(user.user_id.as_str()));

        // The document write already happened; a record that stays pending
        // only means the same resolution may be submitted again.
        if let Err(e) = self.store.set_merge(CONFLICT_COLLECTION, &key, closed).await {
            tracing::error!("Failed to close conflict record {}: {}", key, e);
        }

        Ok(record)
    }
}

//! Queued operations and the sync request that carries them.
//!
//! [`SyncRequest`] mirrors the JSON a device uploads and is deliberately
//! loose so that every shape problem can be reported at once.
//! [`SyncRequest::into_session`] checks the whole batch up front and turns
//! it into a typed [`SyncSession`]; a batch with any problem is rejected
//! before the store is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use super::error::SyncError;
use super::SyncSettings;
use crate::clock::parse_timestamp;
use crate::identity::AuthUser;
use crate::store::Document;

/// Kind of mutation a queued operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationType::Create),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// One operation as uploaded by a device.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOperation {
    #[serde(rename = "type")]
    pub op_type: Option<String>,
    pub collection: Option<String>,
    pub document_id: Option<String>,
    pub data: Option<Value>,
    pub timestamp: Option<Value>,
    pub offline_id: Option<String>,
}

/// Body of a sync submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub operations: Option<Vec<RawOperation>>,
    pub last_sync_timestamp: Option<Value>,
    pub device_id: Option<String>,
    pub app_version: Option<String>,
    pub device_info: Option<Value>,
}

/// A validated queued operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationType,
    pub collection: String,
    /// Target document; always set for update and delete.
    pub document_id: Option<String>,
    /// Entity fields; empty for delete.
    pub data: Document,
    /// When the device says the operation was authored.
    pub authored_at: DateTime<Utc>,
    pub offline_id: String,
}

/// A validated sync submission, bound to the caller.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub user: AuthUser,
    pub device_id: String,
    pub app_version: Option<String>,
    pub device_info: Option<Value>,
    /// The device's claimed watermark of its previous successful sync.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub operations: Vec<Operation>,
}

impl SyncRequest {
    /// Validates the whole request and binds it to `user`.
    ///
    /// Every problem found is reported; nothing is partially accepted.
    pub fn into_session(
        self,
        user: AuthUser,
        settings: &SyncSettings,
    ) -> Result<SyncSession, SyncError> {
        let mut problems = Vec::new();

        let device_id = match self.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                problems.push("deviceId is required".to_string());
                String::new()
            }
        };

        let last_sync_timestamp = match &self.last_sync_timestamp {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = parse_timestamp(value);
                if parsed.is_none() {
                    problems.push(format!("lastSyncTimestamp is not a timestamp: {}", value));
                }
                parsed
            }
        };

        let raw_operations = match self.operations {
            Some(ops) => ops,
            None => {
                problems.push("operations must be an array".to_string());
                Vec::new()
            }
        };

        if raw_operations.len() > settings.max_operations {
            problems.push(format!(
                "too many operations: {} (limit {})",
                raw_operations.len(),
                settings.max_operations
            ));
        }

        let mut seen_offline_ids = HashSet::new();
        let mut operations = Vec::with_capacity(raw_operations.len());
        for (index, raw) in raw_operations.into_iter().enumerate() {
            match validate_operation(raw, settings) {
                Ok(op) => {
                    if !seen_offline_ids.insert(op.offline_id.clone()) {
                        problems.push(format!(
                            "operations[{}]: duplicate offlineId {}",
                            index, op.offline_id
                        ));
                    }
                    operations.push(op);
                }
                Err(errors) => {
                    problems.extend(
                        errors
                            .into_iter()
                            .map(|e| format!("operations[{}]: {}", index, e)),
                    );
                }
            }
        }

        if !problems.is_empty() {
            return Err(SyncError::Validation(problems));
        }

        Ok(SyncSession {
            user,
            device_id,
            app_version: self.app_version.filter(|v| !v.trim().is_empty()),
            device_info: self.device_info,
            last_sync_timestamp,
            operations,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn validate_operation(raw: RawOperation, settings: &SyncSettings) -> Result<Operation, Vec<String>> {
    let mut problems = Vec::new();

    let kind = match raw.op_type.as_deref() {
        Some(t) => match OperationType::parse(t) {
            Some(kind) => Some(kind),
            None => {
                problems.push(format!("unknown operation type {:?}", t));
                None
            }
        },
        None => {
            problems.push("type is required".to_string());
            None
        }
    };

    let collection = non_empty(raw.collection);
    match &collection {
        Some(c) if !settings.allows(c) => {
            problems.push(format!("collection {:?} is not syncable", c));
        }
        Some(_) => {}
        None => problems.push("collection is required".to_string()),
    }

    let offline_id = non_empty(raw.offline_id);
    if offline_id.is_none() {
        problems.push("offlineId is required".to_string());
    }

    let authored_at = match &raw.timestamp {
        Some(value) => {
            let parsed = parse_timestamp(value);
            if parsed.is_none() {
                problems.push(format!("timestamp is not a timestamp: {}", value));
            }
            parsed
        }
        None => {
            problems.push("timestamp is required".to_string());
            None
        }
    };

    let document_id = non_empty(raw.document_id);
    let needs_target = matches!(kind, Some(OperationType::Update | OperationType::Delete));
    if needs_target && document_id.is_none() {
        problems.push(format!(
            "documentId is required for {}",
            kind.map(|k| k.to_string()).unwrap_or_default()
        ));
    }

    let needs_data = matches!(kind, Some(OperationType::Create | OperationType::Update));
    let data = match raw.data {
        Some(Value::Object(map)) => map,
        _ if !needs_data => Document::new(),
        Some(_) => {
            problems.push("data must be an object".to_string());
            Document::new()
        }
        None => {
            problems.push("data is required".to_string());
            Document::new()
        }
    };

    match (kind, collection, offline_id, authored_at) {
        (Some(kind), Some(collection), Some(offline_id), Some(authored_at))
            if problems.is_empty() =>
        {
            Ok(Operation {
                kind,
                collection,
                document_id: match kind {
                    OperationType::Create => None,
                    _ => document_id,
                },
                data,
                authored_at,
                offline_id,
            })
        }
        _ => Err(problems),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use serde_json::json;

    fn user() -> AuthUser {
        AuthUser::new("tech-1", Role::Technician)
    }

    fn request(value: Value) -> SyncRequest {
        serde_json::from_value(value).unwrap()
    }

    fn problems(result: Result<SyncSession, SyncError>) -> Vec<String> {
        match result {
            Err(SyncError::Validation(problems)) => problems,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_batch_becomes_session() {
        let session = request(json!({
            "deviceId": "tablet-7",
            "appVersion": "2.4.1",
            "lastSyncTimestamp": "2024-05-01T08:00:00Z",
            "operations": [
                {"type": "create", "collection": "fuelLogs", "data": {"siteId": "600545"},
                 "timestamp": 1714550400000i64, "offlineId": "A", "documentId": "ignored"},
                {"type": "update", "collection": "sites", "documentId": "600545",
                 "data": {"name": "X"}, "timestamp": "2024-05-01T09:00:00Z", "offlineId": "B"},
                {"type": "delete", "collection": "fuelLogs", "documentId": "f1",
                 "timestamp": "2024-05-01T09:05:00Z", "offlineId": "C"}
            ]
        }))
        .into_session(user(), &SyncSettings::default())
        .unwrap();

        assert_eq!(session.device_id, "tablet-7");
        assert_eq!(session.app_version.as_deref(), Some("2.4.1"));
        assert!(session.last_sync_timestamp.is_some());
        assert_eq!(session.operations.len(), 3);

        let kinds: Vec<OperationType> = session.operations.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationType::Create,
                OperationType::Update,
                OperationType::Delete
            ]
        );
        assert!(session.operations[0].document_id.is_none());
        assert_eq!(session.operations[1].document_id.as_deref(), Some("600545"));
        assert!(session.operations[2].data.is_empty());
    }

    #[test]
    fn test_empty_batch_is_allowed() {
        let session = request(json!({"deviceId": "d1", "operations": []}))
            .into_session(user(), &SyncSettings::default())
            .unwrap();
        assert!(session.operations.is_empty());
        assert!(session.last_sync_timestamp.is_none());
    }

    #[test]
    fn test_missing_operations_and_device() {
        let problems = problems(request(json!({})).into_session(user(), &SyncSettings::default()));
        assert!(problems.contains(&"deviceId is required".to_string()));
        assert!(problems.contains(&"operations must be an array".to_string()));
    }

    #[test]
    fn test_every_operation_problem_is_reported() {
        let problems = problems(
            request(json!({
                "deviceId": "d1",
                "operations": [
                    {"type": "upsert", "collection": "sites", "timestamp": 1, "offlineId": "A"},
                    {"type": "update", "collection": "sites", "data": {"a": 1},
                     "timestamp": 1, "offlineId": "B"},
                    {"type": "create", "collection": "sites", "timestamp": 1, "offlineId": "C"},
                    {"type": "create", "collection": "syncCheckpoints", "data": {},
                     "timestamp": 1, "offlineId": "D"},
                    {"type": "delete", "collection": "sites", "documentId": "x", "offlineId": "E"}
                ]
            }))
            .into_session(user(), &SyncSettings::default()),
        );

        assert_eq!(problems.len(), 5, "{:?}", problems);
        assert!(problems[0].starts_with("operations[0]: unknown operation type"));
        assert_eq!(problems[1], "operations[1]: documentId is required for update");
        assert_eq!(problems[2], "operations[2]: data is required");
        assert!(problems[3].contains("is not syncable"));
        assert_eq!(problems[4], "operations[4]: timestamp is required");
    }

    #[test]
    fn test_duplicate_offline_ids_rejected() {
        let problems = problems(
            request(json!({
                "deviceId": "d1",
                "operations": [
                    {"type": "create", "collection": "fuelLogs", "data": {}, "timestamp": 1, "offlineId": "A"},
                    {"type": "create", "collection": "fuelLogs", "data": {}, "timestamp": 2, "offlineId": "A"}
                ]
            }))
            .into_session(user(), &SyncSettings::default()),
        );
        assert_eq!(problems, vec!["operations[1]: duplicate offlineId A".to_string()]);
    }

    #[test]
    fn test_batch_limit() {
        let settings = SyncSettings {
            max_operations: 1,
            ..SyncSettings::default()
        };
        let problems = problems(
            request(json!({
                "deviceId": "d1",
                "operations": [
                    {"type": "create", "collection": "fuelLogs", "data": {}, "timestamp": 1, "offlineId": "A"},
                    {"type": "create", "collection": "fuelLogs", "data": {}, "timestamp": 1, "offlineId": "B"}
                ]
            }))
            .into_session(user(), &settings),
        );
        assert_eq!(problems, vec!["too many operations: 2 (limit 1)".to_string()]);
    }

    #[test]
    fn test_bad_last_sync_timestamp() {
        let problems = problems(
            request(json!({"deviceId": "d1", "operations": [], "lastSyncTimestamp": "soon"}))
                .into_session(user(), &SyncSettings::default()),
        );
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("lastSyncTimestamp"));
    }
}

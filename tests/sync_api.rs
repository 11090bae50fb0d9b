use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, TimeZone, Utc};
use fieldsync::{
    clock::ManualClock,
    identity::{ApiKeyEntry, ApiKeyStore, Role},
    server::{router, AppState},
    store::{EntityStore, MemoryStore},
    sync::{SyncService, SyncSettings},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const TECH_KEY: &str = "tech-key";
const OTHER_KEY: &str = "other-key";

fn setup() -> (Router, Arc<MemoryStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let sync = SyncService::new(store.clone(), clock.clone(), SyncSettings::default());

    let keys = ApiKeyStore::from_entries(&[
        ApiKeyEntry {
            key: TECH_KEY.to_string(),
            user_id: "tech-1".to_string(),
            role: Role::Technician,
        },
        ApiKeyEntry {
            key: OTHER_KEY.to_string(),
            user_id: "tech-2".to_string(),
            role: Role::Manager,
        },
    ]);

    (router(AppState::new(keys, sync)), store, clock)
}

async fn send(app: &Router, method: &str, uri: &str, key: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json")
    };
    (status, json)
}

fn batch(operations: Value) -> Value {
    json!({
        "deviceId": "tablet-7",
        "appVersion": "2.4.1",
        "lastSyncTimestamp": null,
        "operations": operations
    })
}

#[tokio::test]
async fn health_needs_no_auth() {
    let (app, _store, _clock) = setup();
    let (status, body) = send(&app, "GET", "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_routes_reject_missing_or_bad_credentials() {
    let (app, store, _clock) = setup();
    let body = batch(json!([{
        "type": "create", "collection": "fuelLogs", "data": {},
        "timestamp": 1, "offlineId": "A"
    }]));

    let (status, json) = send(&app, "POST", "/api/sync", None, Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "missing_auth");

    let (status, json) = send(&app, "POST", "/api/sync", Some("nope"), Some(body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "invalid_key");

    let (status, _) = send(&app, "GET", "/api/sync/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(store.count("fuelLogs").await, 0);
}

#[tokio::test]
async fn me_reports_identity() {
    let (app, _store, _clock) = setup();
    let (status, body) = send(&app, "GET", "/api/me", Some(OTHER_KEY), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"userId": "tech-2", "role": "manager"}));
}

#[tokio::test]
async fn invalid_batch_is_rejected_with_all_problems() {
    let (app, store, _clock) = setup();
    let body = json!({
        "operations": [
            {"type": "create", "collection": "fuelLogs", "data": {}, "timestamp": 1, "offlineId": "A"},
            {"type": "merge", "collection": "fuelLogs", "timestamp": 1, "offlineId": "B"}
        ]
    });

    let (status, json) = send(&app, "POST", "/api/sync", Some(TECH_KEY), Some(body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "validation_failed");
    let details = json["details"].as_array().unwrap();
    assert!(details.iter().any(|d| d == "deviceId is required"));
    assert!(details
        .iter()
        .any(|d| d.as_str().unwrap().starts_with("operations[1]")));
    assert_eq!(store.count("fuelLogs").await, 0);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let (app, _store, _clock) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/api/sync")
        .header("authorization", format!("Bearer {}", TECH_KEY))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");

    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn create_then_status_reflects_checkpoint() {
    let (app, store, _clock) = setup();

    let (status, _) = send(&app, "GET", "/api/sync/status", Some(TECH_KEY), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/sync",
        Some(TECH_KEY),
        Some(batch(json!([{
            "type": "create", "collection": "fuelLogs",
            "data": {"siteId": "600545", "currentLevel": 80},
            "timestamp": "2024-05-01T11:00:00Z", "offlineId": "A"
        }]))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["message"], "Sync completed");
    assert_eq!(outcome["summary"], json!({"total": 1, "successful": 1, "conflicts": 0, "errors": 0}));
    let server_id = outcome["results"]["successful"][0]["serverId"].as_str().unwrap();
    assert!(store.get("fuelLogs", server_id).await.unwrap().is_some());

    let (status, body) = send(&app, "GET", "/api/sync/status", Some(TECH_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "synced");
    assert_eq!(body["lastSync"], outcome["timestamp"]);
    assert_eq!(body["deviceId"], "tablet-7");
    assert_eq!(body["lastSyncStats"], json!({"successful": 1, "conflicts": 0, "failed": 0}));
    assert_eq!(body["pendingChanges"], 0);
}

#[tokio::test]
async fn never_synced_status() {
    let (app, _store, _clock) = setup();
    let (status, body) = send(&app, "GET", "/api/sync/status", Some(TECH_KEY), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "never_synced");
    assert_eq!(body["lastSync"], Value::Null);
}

#[tokio::test]
async fn stale_update_conflicts_and_resolves_locally() {
    let (app, store, clock) = setup();
    store
        .set(
            "sites",
            "600545",
            json!({"name": "North", "updatedAt": "2024-05-01T10:00:00Z"})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .await
        .unwrap();

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/sync",
        Some(TECH_KEY),
        Some(batch(json!([{
            "type": "update", "collection": "sites", "documentId": "600545",
            "data": {"name": "X", "updatedAt": "2024-05-01T09:00:00Z"},
            "timestamp": "2024-05-01T11:00:00Z", "offlineId": "B"
        }]))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let conflict = &outcome["results"]["conflicts"][0];
    assert_eq!(conflict["offlineId"], "B");
    assert_eq!(conflict["conflict"]["type"], "update_conflict");
    assert_eq!(conflict["conflict"]["localData"]["name"], "X");
    assert_eq!(conflict["conflict"]["serverData"]["name"], "North");

    let site = store.get("sites", "600545").await.unwrap().unwrap();
    assert_eq!(site.data["name"], "North");

    clock.advance(Duration::minutes(1));
    let (status, report) = send(
        &app,
        "POST",
        "/api/sync/resolve",
        Some(TECH_KEY),
        Some(json!({"conflicts": [{"operationId": "B", "resolution": "local"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["results"][0]["status"], "resolved");
    let site = store.get("sites", "600545").await.unwrap().unwrap();
    assert_eq!(site.data["name"], "X");
}

#[tokio::test]
async fn resolve_rejects_empty_list() {
    let (app, _store, _clock) = setup();
    let (status, body) = send(
        &app,
        "POST",
        "/api/sync/resolve",
        Some(TECH_KEY),
        Some(json!({"conflicts": []})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_failed");
}

#[tokio::test]
async fn change_feed_returns_other_writers_documents() {
    let (app, _store, clock) = setup();
    let since = "2024-05-01T12:00:00.000Z";
    clock.advance(Duration::seconds(30));

    let (status, _) = send(
        &app,
        "POST",
        "/api/sync",
        Some(OTHER_KEY),
        Some(batch(json!([{
            "type": "create", "collection": "maintenanceLogs",
            "data": {"equipmentId": "gen-2", "notes": "oil change"},
            "timestamp": 1, "offlineId": "M1"
        }]))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, feed) = send(
        &app,
        "GET",
        &format!("/api/sync/changes?since={}&collections=maintenanceLogs", since),
        Some(TECH_KEY),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(feed["hasMore"], false);
    let changes = feed["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["collection"], "maintenanceLogs");
    assert_eq!(changes[0]["data"]["createdBy"], "tech-2");

    let (status, _) = send(
        &app,
        "GET",
        "/api/sync/changes?collections=syncCheckpoints",
        Some(TECH_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn change_feed_pages_with_cursor() {
    let (app, _store, clock) = setup();
    clock.advance(Duration::seconds(30));

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/sync",
        Some(OTHER_KEY),
        Some(batch(json!([
            {"type": "create", "collection": "maintenanceLogs", "data": {"notes": "a"},
             "timestamp": 1, "offlineId": "M1"},
            {"type": "create", "collection": "maintenanceLogs", "data": {"notes": "b"},
             "timestamp": 2, "offlineId": "M2"},
            {"type": "create", "collection": "maintenanceLogs", "data": {"notes": "c"},
             "timestamp": 3, "offlineId": "M3"}
        ]))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["summary"]["successful"], 3);

    let (status, first) = send(
        &app,
        "GET",
        "/api/sync/changes?collections=maintenanceLogs&limit=2",
        Some(TECH_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["hasMore"], true);
    assert_eq!(first["changes"].as_array().unwrap().len(), 2);

    let cursor = first["nextCursor"]
        .as_str()
        .unwrap()
        .replace(':', "%3A")
        .replace('|', "%7C");
    let (status, second) = send(
        &app,
        "GET",
        &format!("/api/sync/changes?collections=maintenanceLogs&limit=2&cursor={}", cursor),
        Some(TECH_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["hasMore"], false);

    let mut ids: Vec<&str> = first["changes"]
        .as_array()
        .unwrap()
        .iter()
        .chain(second["changes"].as_array().unwrap())
        .map(|c| c["documentId"].as_str().unwrap())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn change_feed_rejects_bad_query() {
    let (app, _store, _clock) = setup();

    let (status, body) = send(&app, "GET", "/api/sync/changes?limit=lots", Some(TECH_KEY), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_failed");

    let (status, body) = send(&app, "GET", "/api/sync/changes?cursor=nonsense", Some(TECH_KEY), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_failed");
}

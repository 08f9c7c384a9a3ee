use axum::http::StatusCode;
use chrono::Utc;
use dnp_core::adapter::{AdapterRegistry, Capabilities, SimulatedAdapter};
use dnp_core::checkpoint::BatchCheckpoint;
use dnp_core::config::{Config, ProviderConfig};
use dnp_core::ledger::EnforcementAction;
use dnp_core::types::{ActionKind, EntityType};
use dnp_server::{build_router, AppState};
use http_body_util::BodyExt;
use tempfile::TempDir;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize `.dnp/` with one configured provider and open the app state.
fn init_root(dir: &TempDir) -> AppState {
    Config::new()
        .with_provider("spotify", ProviderConfig::default())
        .save(dir.path())
        .unwrap();
    AppState::open(dir.path().to_path_buf()).unwrap()
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    send(app, req).await
}

/// Send a POST request with a JSON body via `oneshot`.
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(app, req).await
}

async fn send(
    app: axum::Router,
    req: axum::http::Request<axum::body::Body>,
) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn submission(key: &str) -> serde_json::Value {
    serde_json::json!({
        "user": "user-1",
        "provider": "spotify",
        "idempotency_key": key,
        "action_items": [
            { "entity_type": "track", "entity_id": "t1", "action": "remove" },
            { "entity_type": "artist", "entity_id": "a1", "action": "unfollow" },
        ],
    })
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn providers_list_includes_configured_provider() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (status, body) = get(app, "/api/providers").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["provider"], "spotify");
    assert_eq!(list[0]["circuit"]["state"], "closed");
    assert_eq!(list[0]["rate_limit"]["requests_remaining"], 100);
}

#[tokio::test]
async fn provider_with_bad_name_is_400() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (status, body) = get(app, "/api/providers/Not%20Valid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid provider"));
}

#[tokio::test]
async fn circuit_reset_returns_closed_state() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (status, body) = post_json(
        app.clone(),
        "/api/providers/spotify/circuit/reset",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "closed");
    assert_eq!(body["failure_count"], 0);

    let (status, body) = get(app, "/api/providers/spotify").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["circuit"]["state"], "closed");
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_is_idempotent_by_key() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (status, first) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["created"], true);
    assert_eq!(first["batch"]["status"], "pending");

    let (status, second) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(second["batch"]["id"], first["batch"]["id"]);

    let (_, list) = get(app, "/api/batches").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn batches_can_be_looked_up_by_key() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));
    let (_, first) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    post_json(app.clone(), "/api/batches", submission("k-2")).await;

    let (status, found) = get(app.clone(), "/api/batches?key=k-1").await;
    assert_eq!(status, StatusCode::OK);
    let found = found.as_array().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["id"], first["batch"]["id"]);

    let (_, missing) = get(app, "/api/batches?key=nope").await;
    assert!(missing.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_submission_is_400() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let mut body = submission("k-1");
    body["user"] = serde_json::json!("  ");
    let (status, body) = post_json(app, "/api/batches", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("user is empty"));
}

#[tokio::test]
async fn batch_detail_lists_items_in_order() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (_, created) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    let id = created["batch"]["id"].as_str().unwrap().to_string();

    let (status, detail) = get(app, &format!("/api/batches/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let items = detail["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["entity_id"], "t1");
    assert_eq!(items[0]["position"], 0);
    assert_eq!(items[1]["action"], "unfollow");
}

#[tokio::test]
async fn checkpoint_exists_once_a_run_starts() {
    let dir = TempDir::new().unwrap();
    let state = init_root(&dir);
    let app = build_router(state.clone());

    let (_, created) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    let id: Uuid = created["batch"]["id"].as_str().unwrap().parse().unwrap();
    let uri = format!("/api/batches/{id}/checkpoint");

    let (status, _) = get(app.clone(), &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut cp = BatchCheckpoint::new(id, 2, Utc::now());
    cp.advance(0, Some(Uuid::new_v4()), false, None, Utc::now());
    state.db.save_checkpoint(&cp).unwrap();

    let (status, body) = get(app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_items"], 2);
    assert_eq!(body["current_position"], 1);
    assert_eq!(body["processed_items"], 1);
}

#[tokio::test]
async fn unknown_batch_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (status, _) = get(app.clone(), &format!("/api/batches/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(app, "/api/batches/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_twice_reports_already_cancelled() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));

    let (_, created) = post_json(app.clone(), "/api/batches", submission("k-1")).await;
    let id = created["batch"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/batches/{id}/cancel");

    let (status, body) = post_json(app.clone(), &uri, serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "cancelled");

    let (_, body) = post_json(app.clone(), &uri, serde_json::json!({})).await;
    assert_eq!(body["outcome"], "already_cancelled");

    let (_, detail) = get(app, &format!("/api/batches/{id}")).await;
    assert_eq!(detail["batch"]["status"], "cancelled");
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

fn ledger_entry(run_id: Uuid, resource_id: &str, at: chrono::DateTime<Utc>) -> EnforcementAction {
    EnforcementAction {
        id: Uuid::new_v4(),
        run_id,
        sequence: 0,
        user: "user-1".into(),
        provider: "spotify".into(),
        item_id: Uuid::new_v4(),
        resource_type: EntityType::Track,
        resource_id: resource_id.into(),
        resource_name: None,
        action: ActionKind::Remove,
        previous_state: serde_json::json!({ "in_library": true }),
        resulting_state: serde_json::json!({ "in_library": false }),
        idempotency_key: format!("{run_id}:{resource_id}"),
        reverses: None,
        created_at: at,
    }
}

#[tokio::test]
async fn run_ledger_lists_entries_in_sequence() {
    let dir = TempDir::new().unwrap();
    let state = init_root(&dir);
    let run_id = Uuid::new_v4();
    let now = Utc::now();
    state.db.append_ledger(ledger_entry(run_id, "t1", now)).unwrap();
    state.db.append_ledger(ledger_entry(run_id, "t2", now)).unwrap();
    let app = build_router(state);

    let (status, body) = get(app.clone(), &format!("/api/runs/{run_id}/ledger")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["sequence"], 1);
    assert_eq!(entries[1]["resource_id"], "t2");

    let (_, runs) = get(app, "/api/runs").await;
    assert_eq!(runs[0]["entries"], 2);
}

#[tokio::test]
async fn archived_run_is_gone_unless_asked_for() {
    let dir = TempDir::new().unwrap();
    let state = init_root(&dir);
    let run_id = Uuid::new_v4();
    let old = Utc::now() - chrono::Duration::days(30);
    state.db.append_ledger(ledger_entry(run_id, "t1", old)).unwrap();
    state
        .db
        .prune_ledger(Utc::now() - chrono::Duration::days(7), Utc::now())
        .unwrap();
    let app = build_router(state);

    let (status, _) = get(app.clone(), &format!("/api/runs/{run_id}/ledger")).await;
    assert_eq!(status, StatusCode::GONE);

    let (status, body) = get(app, &format!("/api/runs/{run_id}/ledger?archived=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_run_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(init_root(&dir));
    let (status, _) = get(app, &format!("/api/runs/{}/ledger", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rollback_reverses_a_run_through_linked_adapters() {
    let dir = TempDir::new().unwrap();
    let state = init_root(&dir).with_adapters(AdapterRegistry::new().with(Arc::new(
        SimulatedAdapter::new("spotify", Capabilities::default()),
    )));
    let run_id = Uuid::new_v4();
    let now = Utc::now();
    state.db.append_ledger(ledger_entry(run_id, "t1", now)).unwrap();
    state.db.append_ledger(ledger_entry(run_id, "t2", now)).unwrap();
    let app = build_router(state);
    let uri = format!("/api/runs/{run_id}/rollback");

    let (status, report) = post_json(
        app.clone(),
        &uri,
        serde_json::json!({ "scope": "partial", "resource_ids": ["t2"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = report["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["resource_id"], "t2");
    assert_eq!(items[0]["status"], "reversed");
    assert_eq!(items[0]["action"], "restore");

    let (_, report) = post_json(app.clone(), &uri, serde_json::json!({ "scope": "full" })).await;
    let statuses: Vec<_> = report["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["status"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(statuses, vec!["already_rolled_back", "reversed"]);

    let (_, entries) = get(app, &format!("/api/runs/{run_id}/ledger")).await;
    assert_eq!(entries.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn rollback_without_an_adapter_is_404() {
    let dir = TempDir::new().unwrap();
    let state = init_root(&dir);
    let run_id = Uuid::new_v4();
    state.db.append_ledger(ledger_entry(run_id, "t1", Utc::now())).unwrap();
    let app = build_router(state);

    let (status, body) = post_json(
        app,
        &format!("/api/runs/{run_id}/rollback"),
        serde_json::json!({ "scope": "full" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("spotify"));
}

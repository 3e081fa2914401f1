//! End-to-end client runner tests against an in-process server: full
//! cycles over HTTP, pending sync-request execution, and cursor tracking.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tally::client::{ClientStore, RunnerState, SyncRunner};
use tally::config::Config;
use tally::services::SqliteStore;
use tally::types::{Actor, Role, SyncRequest, SyncRequestType, TableUpserts};
use tally::{api, AppState};

use tower_http::trace::TraceLayer;

const TYPE_ID: &str = "11111111-1111-4111-8111-111111111111";
const ENTITY_ID: &str = "22222222-2222-4222-8222-222222222222";

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Spin the full router on an ephemeral port, returning the base URL.
async fn serve(state: AppState) -> String {
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn state() -> AppState {
    let config = Arc::new(Config::from_env());
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    AppState::build(config, store).unwrap()
}

async fn seed_server(state: &AppState) {
    state
        .push
        .push(
            "seed",
            &Actor::new("u1", Role::User),
            &[
                TableUpserts {
                    table: "entity_types".into(),
                    rows: vec![obj(json!({
                        "id": TYPE_ID,
                        "created_at": 1000,
                        "updated_at": 1000,
                        "name": "Machines",
                    }))],
                },
                TableUpserts {
                    table: "entities".into(),
                    rows: vec![obj(json!({
                        "id": ENTITY_ID,
                        "created_at": 1000,
                        "updated_at": 1000,
                        "type_id": TYPE_ID,
                        "name": "press",
                    }))],
                },
            ],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_full_cycle_pulls_server_rows() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store.clone());

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    assert_eq!(status.cursor, state.store.max_seq().unwrap());
    assert!(status.last_error.is_none());

    let entity = store.get_row("entities", ENTITY_ID).unwrap().unwrap();
    assert_eq!(entity["typeId"], TYPE_ID);
    assert_eq!(entity["syncStatus"], "synced");

    // The cycle also uploaded a snapshot the reporter can diff.
    let snapshot = state.store.latest_snapshot("device-1").unwrap();
    assert!(snapshot.is_some());
}

#[tokio::test]
async fn test_local_edits_push_and_round_trip() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store.clone());
    runner.run_once().await;

    // Edit locally: stage a new note as pending.
    let note_id = "33333333-3333-4333-8333-333333333331";
    store
        .stage_local_row(
            "notes",
            &obj(json!({
                "id": note_id,
                "createdAt": 5000,
                "updatedAt": 5000,
                "ownerUserId": "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaa1",
                "title": "from the field",
            })),
        )
        .unwrap();

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);

    // The server accepted it and assigned a seq; the local row settled.
    let server_row = state.store.get_row("notes", note_id).unwrap().unwrap();
    assert!(server_row.last_server_seq.is_some());
    let local_row = store.get_row("notes", note_id).unwrap().unwrap();
    assert_eq!(local_row["syncStatus"], "synced");
    assert_eq!(
        local_row["lastServerSeq"].as_i64(),
        server_row.last_server_seq
    );
}

#[tokio::test]
async fn test_force_full_pull_request_resets_cursor_and_acks() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store.clone());
    runner.run_once().await;
    assert!(store.cursor().unwrap() > 0);

    // Queue a force full pull for this client.
    let request = SyncRequest {
        request_id: "req-force-1".into(),
        client_id: "device-1".into(),
        request_type: SyncRequestType::ForceFullPullV2,
        payload: json!({}),
        created_at: chrono::Utc::now().timestamp_millis(),
        acked_at: None,
        ack_status: None,
        ack_error: None,
    };
    state.store.insert_sync_request(&request).unwrap();

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    // Cursor was reset and re-advanced by the full pull.
    assert_eq!(status.cursor, state.store.max_seq().unwrap());

    // The request was acknowledged and cleared.
    assert!(state
        .store
        .pending_sync_request("device-1")
        .unwrap()
        .is_none());
    let acked = state.store.newest_sync_request("device-1").unwrap().unwrap();
    assert_eq!(acked.ack_status.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_reset_request_wipes_and_rebuilds() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store.clone());
    runner.run_once().await;
    assert_eq!(store.count_rows("entities").unwrap(), 1);

    let request = SyncRequest {
        request_id: "req-reset-1".into(),
        client_id: "device-1".into(),
        request_type: SyncRequestType::ResetSyncStateAndPull,
        payload: json!({}),
        created_at: chrono::Utc::now().timestamp_millis(),
        acked_at: None,
        ack_status: None,
        ack_error: None,
    };
    state.store.insert_sync_request(&request).unwrap();

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    // Wiped, then repopulated from seq 0.
    assert_eq!(store.count_rows("entities").unwrap(), 1);
    assert_eq!(store.cursor().unwrap(), state.store.max_seq().unwrap());
}

#[tokio::test]
async fn test_delete_local_entity_request() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store.clone());
    runner.run_once().await;

    let request = SyncRequest {
        request_id: "req-del-1".into(),
        client_id: "device-1".into(),
        request_type: SyncRequestType::DeleteLocalEntity,
        payload: json!({ "table": "entities", "rowId": ENTITY_ID }),
        created_at: chrono::Utc::now().timestamp_millis(),
        acked_at: None,
        ack_status: None,
        ack_error: None,
    };
    state.store.insert_sync_request(&request).unwrap();

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    // The pull right after re-applies the server copy; what matters is
    // the request executed and was acked.
    let acked = state.store.newest_sync_request("device-1").unwrap().unwrap();
    assert_eq!(acked.request_id, "req-del-1");
    assert_eq!(acked.ack_status.as_deref(), Some("ok"));
}

#[tokio::test]
async fn test_run_once_single_flight() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new("device-1", "u1", Role::User, base, store);

    // Two concurrent invocations: one runs, the other returns status
    // immediately instead of queuing a second pass.
    let (a, b) = tokio::join!(runner.run_once(), runner.run_once());
    let statuses = [&a, &b];
    let ran: Vec<_> = statuses
        .iter()
        .filter(|s| s.last_run_at.is_some())
        .collect();
    assert!(!ran.is_empty());

    // A follow-up run still works.
    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    runner.stop_auto();
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_error_then_recovery_resets_backoff() {
    let state = state();
    seed_server(&state).await;
    let base = serve(state.clone()).await;

    let store = Arc::new(ClientStore::new_in_memory().unwrap());
    let runner = SyncRunner::new(
        "device-1",
        "u1",
        Role::User,
        "http://127.0.0.1:1",
        store,
    );

    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Error);
    assert!(status.last_error.is_some());

    // Point at the live server and recover.
    runner.set_api_base_url(base);
    let status = runner.run_once().await;
    assert_eq!(status.state, RunnerState::Idle);
    assert!(status.last_error.is_none());
}

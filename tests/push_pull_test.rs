//! Integration tests for the push applier and pull producer: conflict
//! rules, dependency ordering, chat policy and privacy scoping.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tally::config::Config;
use tally::services::SqliteStore;
use tally::types::{Actor, Role, TableUpserts};
use tally::AppState;

const TYPE_ID: &str = "11111111-1111-4111-8111-111111111111";
const ENTITY_ID: &str = "22222222-2222-4222-8222-222222222222";
const U1: &str = "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaa1";
const U2: &str = "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaa2";
const M1: &str = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbb1";
const M2: &str = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbb2";

fn state() -> AppState {
    let config = Arc::new(Config::from_env());
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    AppState::build(config, store).unwrap()
}

fn user(id: &str) -> Actor {
    Actor::new(id, Role::User)
}

fn admin() -> Actor {
    Actor::new("admin-user", Role::Admin)
}

fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn upserts(table: &str, rows: Vec<Value>) -> Vec<TableUpserts> {
    vec![TableUpserts {
        table: table.to_string(),
        rows: rows.into_iter().map(obj).collect(),
    }]
}

fn type_row(updated_at: i64) -> Value {
    json!({
        "id": TYPE_ID,
        "created_at": 1000,
        "updated_at": updated_at,
        "name": "Machines",
    })
}

fn entity_row(updated_at: i64) -> Value {
    json!({
        "id": ENTITY_ID,
        "created_at": 1000,
        "updated_at": updated_at,
        "type_id": TYPE_ID,
        "name": "press",
    })
}

fn chat_row(id: &str, sender: &str, recipient: Option<&str>, updated_at: i64) -> Value {
    json!({
        "id": id,
        "created_at": 1000,
        "updated_at": updated_at,
        "sender_user_id": sender,
        "recipient_user_id": recipient,
        "body": "hello",
    })
}

async fn seed_entity(state: &AppState) {
    state
        .push
        .push(
            "seed",
            &user(U1),
            &[
                TableUpserts {
                    table: "entity_types".into(),
                    rows: vec![obj(type_row(1000))],
                },
                TableUpserts {
                    table: "entities".into(),
                    rows: vec![obj(entity_row(1000))],
                },
            ],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_undelete_over_tombstone_with_known_seq_conflicts() {
    let state = state();
    seed_entity(&state).await;

    // Tombstone the entity server-side.
    let mut tombstone = obj(entity_row(1500));
    tombstone.insert("deleted_at".into(), json!(1500));
    state
        .push
        .push("c1", &user(U1), &[TableUpserts {
            table: "entities".into(),
            rows: vec![tombstone],
        }])
        .await
        .unwrap();
    let seq_before = state.store.max_seq().unwrap();

    // A client that never pulled the tombstone tries to undelete.
    let mut undelete = obj(entity_row(2000));
    undelete.insert("deleted_at".into(), Value::Null);
    undelete.remove("last_server_seq");
    let err = state
        .push
        .push("c2", &user(U2), &upserts("entities", vec![Value::Object(undelete)]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "sync_conflict");
    // No change-log entry; state unchanged.
    assert_eq!(state.store.max_seq().unwrap(), seq_before);
    let row = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();
    assert!(row.deleted_at.is_some());
}

#[tokio::test]
async fn test_newer_last_server_seq_wins_despite_older_updated_at() {
    let state = state();
    seed_entity(&state).await;
    let existing = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();
    let existing_seq = existing.last_server_seq.unwrap();

    let mut update = obj(json!({
        "id": ENTITY_ID,
        "created_at": 800,
        "updated_at": 900,
        "type_id": TYPE_ID,
        "name": "press",
    }));
    update.insert("last_server_seq".into(), json!(existing_seq + 1));
    let response = state
        .push
        .push("c1", &user(U1), &upserts("entities", vec![Value::Object(update)]))
        .await
        .unwrap();

    assert_eq!(response.applied, 1);
    let row = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();
    // The stored seq is server-assigned, not the client echo.
    assert_eq!(row.last_server_seq, Some(response.last_seq));
    assert_eq!(row.updated_at, 900);
}

#[tokio::test]
async fn test_stale_last_server_seq_rejected() {
    let state = state();
    seed_entity(&state).await;
    let existing = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();

    let mut update = obj(entity_row(5000));
    update.insert(
        "last_server_seq".into(),
        json!(existing.last_server_seq.unwrap() - 1),
    );
    let err = state
        .push
        .push("c1", &user(U1), &upserts("entities", vec![Value::Object(update)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sync_conflict");
}

#[tokio::test]
async fn test_dependency_missing_aborts_batch() {
    let state = state();
    let note_id = "cccccccc-cccc-4ccc-8ccc-ccccccccccc1";

    // entity_types is empty; the entities row names an unknown type. The
    // notes row in the same batch must not survive the abort.
    let err = state
        .push
        .push(
            "c1",
            &user(U1),
            &[
                TableUpserts {
                    table: "entities".into(),
                    rows: vec![obj(entity_row(1000))],
                },
                TableUpserts {
                    table: "notes".into(),
                    rows: vec![obj(json!({
                        "id": note_id,
                        "created_at": 1000,
                        "updated_at": 1000,
                        "owner_user_id": U1,
                        "title": "orphan",
                    }))],
                },
            ],
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "sync_dependency_missing");
    assert_eq!(state.store.max_seq().unwrap(), 0);
    assert!(state.store.get_row("notes", note_id).unwrap().is_none());
}

#[tokio::test]
async fn test_dependency_satisfied_within_one_push() {
    let state = state();
    // Parent and child in one batch, submitted child-table-first; the
    // applier reorders by registry topology.
    let response = state
        .push
        .push(
            "c1",
            &user(U1),
            &[
                TableUpserts {
                    table: "entities".into(),
                    rows: vec![obj(entity_row(1000))],
                },
                TableUpserts {
                    table: "entity_types".into(),
                    rows: vec![obj(type_row(1000))],
                },
            ],
        )
        .await
        .unwrap();
    assert_eq!(response.applied, 2);
    // Parent applied first.
    assert_eq!(response.applied_rows[0].table, "entity_types");
    assert_eq!(response.applied_rows[1].table, "entities");
}

#[tokio::test]
async fn test_push_idempotent() {
    let state = state();
    seed_entity(&state).await;
    let row = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();

    // Re-submit exactly what the server already stores.
    let mut resubmit = obj(entity_row(1000));
    resubmit.insert("last_server_seq".into(), json!(row.last_server_seq.unwrap()));
    let seq_before = state.store.max_seq().unwrap();
    let response = state
        .push
        .push("c1", &user(U1), &upserts("entities", vec![Value::Object(resubmit)]))
        .await
        .unwrap();

    assert_eq!(response.applied, 0);
    assert_eq!(state.store.max_seq().unwrap(), seq_before);
}

#[tokio::test]
async fn test_validation_error_names_field() {
    let state = state();
    let mut bad = obj(type_row(1000));
    bad.remove("name");
    let err = state
        .push
        .push("c1", &user(U1), &upserts("entity_types", vec![Value::Object(bad)]))
        .await
        .unwrap_err();
    match err {
        tally::error::AppError::SyncValidation { table, field, .. } => {
            assert_eq!(table, "entity_types");
            assert_eq!(field, "name");
        }
        other => panic!("expected sync_validation_error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_last_server_seq_tracks_newest_entry() {
    let state = state();
    seed_entity(&state).await;
    for updated_at in [2000, 3000, 4000] {
        state
            .push
            .push("c1", &user(U1), &upserts("entities", vec![entity_row(updated_at)]))
            .await
            .unwrap();
    }
    let row = state.store.get_row("entities", ENTITY_ID).unwrap().unwrap();
    let newest = state
        .store
        .latest_seq_for("entities", ENTITY_ID)
        .unwrap()
        .unwrap();
    assert_eq!(row.last_server_seq, Some(newest));
}

#[tokio::test]
async fn test_chat_sender_only_update() {
    let state = state();
    state
        .push
        .push(
            "c1",
            &user(U1),
            &upserts("chat_messages", vec![chat_row(M1, U1, Some(U2), 1000)]),
        )
        .await
        .unwrap();

    // A non-admin stranger to the message cannot update it.
    let err = state
        .push
        .push(
            "c2",
            &user(U2),
            &upserts("chat_messages", vec![chat_row(M1, U1, Some(U2), 2000)]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sync_policy_denied");

    // The sender can.
    let response = state
        .push
        .push(
            "c1",
            &user(U1),
            &upserts("chat_messages", vec![chat_row(M1, U1, Some(U2), 2000)]),
        )
        .await
        .unwrap();
    assert_eq!(response.applied, 1);

    // So can an admin.
    let response = state
        .push
        .push(
            "ops",
            &admin(),
            &upserts("chat_messages", vec![chat_row(M1, U1, Some(U2), 3000)]),
        )
        .await
        .unwrap();
    assert_eq!(response.applied, 1);
}

#[tokio::test]
async fn test_chat_privacy_on_pull() {
    let state = state();
    // m1 is a direct message between u1 and u2; m2 is a broadcast.
    state
        .push
        .push(
            "c1",
            &user(U1),
            &upserts(
                "chat_messages",
                vec![chat_row(M1, U1, Some(U2), 1000), chat_row(M2, U1, None, 1001)],
            ),
        )
        .await
        .unwrap();

    let chats = |response: &tally::types::PullResponse| {
        response
            .changes
            .iter()
            .filter(|c| c.table == "chat_messages")
            .map(|c| c.row_id.clone())
            .collect::<Vec<_>>()
    };

    let as_u2 = state.pull.pull(&user(U2), 0, None, None, 2).unwrap();
    assert_eq!(chats(&as_u2), vec![M1.to_string(), M2.to_string()]);

    let as_u3 = state
        .pull
        .pull(&user("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaa3"), 0, None, None, 2)
        .unwrap();
    assert_eq!(chats(&as_u3), vec![M2.to_string()]);

    let as_admin = state.pull.pull(&admin(), 0, None, None, 2).unwrap();
    assert_eq!(chats(&as_admin), vec![M1.to_string(), M2.to_string()]);

    // The privacy filter never stalls the cursor.
    assert_eq!(as_u3.server_cursor, as_admin.server_cursor);
}

#[tokio::test]
async fn test_pull_pagination_and_client_state() {
    let state = state();
    seed_entity(&state).await;
    for updated_at in [2000, 3000, 4000] {
        state
            .push
            .push("c1", &user(U1), &upserts("entities", vec![entity_row(updated_at)]))
            .await
            .unwrap();
    }
    let last = state.store.max_seq().unwrap();

    let first = state
        .pull
        .pull(&user(U1), 0, Some(2), Some("puller"), 2)
        .unwrap();
    assert_eq!(first.changes.len(), 2);
    assert_eq!(first.server_cursor, 2);
    assert_eq!(first.server_last_seq, last);
    assert!(first.has_more);

    let second = state
        .pull
        .pull(&user(U1), first.server_cursor, None, Some("puller"), 2)
        .unwrap();
    assert_eq!(second.server_cursor, last);
    assert!(!second.has_more);

    let client_state = state.store.get_client_state("puller").unwrap().unwrap();
    assert_eq!(client_state.last_pulled_server_seq, last);
}

#[tokio::test]
async fn test_pull_protocol_enforcement() {
    let mut config = Config::from_env();
    config.sync_v2_enforce = true;
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let state = AppState::build(Arc::new(config), store).unwrap();

    let err = state.pull.pull(&user(U1), 0, None, None, 1).unwrap_err();
    assert_eq!(err.kind(), "protocol_upgrade_required");

    // Version 2 clients are fine.
    assert!(state.pull.pull(&user(U1), 0, None, None, 2).is_ok());
}

#[tokio::test]
async fn test_change_log_seqs_dense_within_block() {
    let state = state();
    let response = state
        .push
        .push(
            "c1",
            &user(U1),
            &[
                TableUpserts {
                    table: "entity_types".into(),
                    rows: vec![obj(type_row(1000))],
                },
                TableUpserts {
                    table: "entities".into(),
                    rows: vec![obj(entity_row(1000))],
                },
            ],
        )
        .await
        .unwrap();
    let seqs: Vec<i64> = response.applied_rows.iter().map(|r| r.server_seq).collect();
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    let blocks = state.ledger.list_blocks_since(0, 10).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].entries.len(), 2);
}

//! Ledger endpoints: materialized state queries, block listing and direct
//! transaction submission.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{AppError, Result};
use crate::types::{Actor, LedgerTx, QueryOptions, SortDir};
use crate::AppState;

/// Create the ledger router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/state/query", get(query_state))
        .route("/blocks", get(blocks))
        .route("/tx/submit", post(submit_txs))
}

/// Raw query parameters of GET /ledger/state/query; JSON-valued fields
/// arrive URL-encoded as strings.
#[derive(Debug, Deserialize)]
struct StateQueryParams {
    table: String,
    id: Option<String>,
    filter: Option<String>,
    or_filter: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
    include_deleted: Option<bool>,
    date_field: Option<String>,
    date_from: Option<i64>,
    date_to: Option<i64>,
    like_field: Option<String>,
    like: Option<String>,
    regex_field: Option<String>,
    regex: Option<String>,
    regex_flags: Option<String>,
    cursor_value: Option<String>,
    cursor_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse_json_object(raw: &str, name: &str) -> Result<Map<String, Value>> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .ok_or_else(|| AppError::Validation(format!("{name} must be a JSON object")))
}

impl StateQueryParams {
    fn into_options(self) -> Result<(String, QueryOptions)> {
        let filter = self
            .filter
            .as_deref()
            .map(|raw| parse_json_object(raw, "filter"))
            .transpose()?;
        let or_filter = self
            .or_filter
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<Value>(raw)
                    .ok()
                    .and_then(|v| v.as_array().cloned())
                    .map(|clauses| {
                        clauses
                            .into_iter()
                            .map(|c| {
                                c.as_object().cloned().ok_or_else(|| {
                                    AppError::Validation(
                                        "or_filter clauses must be JSON objects".into(),
                                    )
                                })
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .unwrap_or_else(|| {
                        Err(AppError::Validation("or_filter must be a JSON array".into()))
                    })
            })
            .transpose()?;
        let sort_dir = match self.sort_dir.as_deref() {
            None | Some("asc") => SortDir::Asc,
            Some("desc") => SortDir::Desc,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "sort_dir must be asc or desc, got {other}"
                )))
            }
        };
        // A cursor value is JSON when it parses, a bare string otherwise.
        let cursor_value = self
            .cursor_value
            .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)));

        Ok((
            self.table,
            QueryOptions {
                id: self.id,
                filter,
                or_filter,
                sort_by: self.sort_by,
                sort_dir,
                include_deleted: self.include_deleted.unwrap_or(false),
                date_field: self.date_field,
                date_from: self.date_from,
                date_to: self.date_to,
                like_field: self.like_field,
                like: self.like,
                regex_field: self.regex_field,
                regex: self.regex,
                regex_flags: self.regex_flags,
                cursor_value,
                cursor_id: self.cursor_id,
                limit: self.limit,
                offset: self.offset,
            },
        ))
    }
}

/// GET /ledger/state/query
async fn query_state(
    State(state): State<AppState>,
    _actor: Actor,
    Query(params): Query<StateQueryParams>,
) -> Result<Json<Value>> {
    let (table, opts) = params.into_options()?;
    let rows = state.ledger.query_state(&table, &opts).await?;
    Ok(Json(json!({ "ok": true, "rows": rows })))
}

#[derive(Debug, Deserialize)]
struct BlocksQuery {
    #[serde(default)]
    since: i64,
    limit: Option<i64>,
}

/// GET /ledger/blocks?since=&limit=
async fn blocks(
    State(state): State<AppState>,
    _actor: Actor,
    Query(query): Query<BlocksQuery>,
) -> Result<Json<Value>> {
    let blocks = state
        .ledger
        .list_blocks_since(query.since, query.limit.unwrap_or(100))?;
    let last_height = state.ledger.height().await;
    Ok(Json(json!({
        "ok": true,
        "last_height": last_height,
        "blocks": blocks,
    })))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    txs: Vec<LedgerTx>,
}

/// POST /ledger/tx/submit
///
/// Sign and append a transaction batch. Requires an authenticated actor.
async fn submit_txs(
    State(state): State<AppState>,
    _actor: Actor,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Value>> {
    let batch = state.ledger.sign_and_append(request.txs).await?;
    Ok(Json(json!({
        "ok": true,
        "applied": batch.applied,
        "lastSeq": batch.last_seq,
        "height": batch.height,
        "appliedRows": batch.applied_rows,
    })))
}

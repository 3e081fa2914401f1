//! Sync endpoints: client push batches and cursor-based change pulls.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::types::{Actor, PullQuery, PullResponse, PushRequest, PushResponse};
use crate::AppState;

/// Create the sync router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/push", post(push))
        .route("/changes", get(changes))
}

/// POST /sync/push
///
/// Ingest a batch of upserts from a client. All-or-nothing; the response
/// carries the server-assigned seq per applied row.
async fn push(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = state
        .push
        .push(&request.client_id, &actor, &request.upserts)
        .await?;
    Ok(Json(response))
}

/// GET /sync/changes?since=&limit=&client_id=&sync_protocol_version=
///
/// Stream changes past the client cursor, privacy-scoped to the actor.
async fn changes(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = state.pull.pull(
        &actor,
        query.since,
        query.limit,
        query.client_id.as_deref(),
        query.sync_protocol_version,
    )?;
    Ok(Json(response))
}

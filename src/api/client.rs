//! Client-facing settings endpoints: settings poll (carrying any pending
//! sync request), sync-request acknowledgement, and diagnostics snapshot
//! upload.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::services::pull::SYNC_PROTOCOL_VERSION;
use crate::types::{
    ClientInfo, ClientSettings, ClientSettingsQuery, ClientSettingsResponse, ClientSnapshot,
    SyncRequestAck,
};
use crate::AppState;

/// Create the client router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/settings", get(settings))
        .route("/settings/sync-request/ack", post(ack_sync_request))
        .route("/diagnostics/snapshot", post(record_snapshot))
}

/// GET /client/settings?clientId=...
///
/// Cached client settings plus any pending sync request.
async fn settings(
    State(state): State<AppState>,
    Query(query): Query<ClientSettingsQuery>,
) -> Result<Json<ClientSettingsResponse>> {
    debug!(
        "Settings poll from {} ({} {} {})",
        query.client_id,
        query.hostname.as_deref().unwrap_or("-"),
        query.platform.as_deref().unwrap_or("-"),
        query.version.as_deref().unwrap_or("-"),
    );
    state.clients_seen.insert(
        query.client_id.clone(),
        ClientInfo {
            client_id: query.client_id.clone(),
            version: query.version.clone(),
            hostname: query.hostname.clone(),
            platform: query.platform.clone(),
            arch: query.arch.clone(),
            username: query.username.clone(),
            last_seen_at: chrono::Utc::now().timestamp_millis(),
        },
    );
    let sync_request = state.store.pending_sync_request(&query.client_id)?;
    Ok(Json(ClientSettingsResponse {
        ok: true,
        settings: ClientSettings {
            sync_interval_ms: state.config.sync_interval_ms,
            settings_poll_interval_ms: state.config.settings_poll_interval_ms,
            sync_protocol_version: SYNC_PROTOCOL_VERSION,
        },
        sync_request,
    }))
}

/// POST /client/settings/sync-request/ack
async fn ack_sync_request(
    State(state): State<AppState>,
    Json(ack): Json<SyncRequestAck>,
) -> Result<Json<Value>> {
    if ack.status != "ok" && ack.status != "error" {
        return Err(AppError::Validation(format!(
            "ack status must be ok or error, got {}",
            ack.status
        )));
    }
    let found = state.store.ack_sync_request(
        &ack.request_id,
        &ack.status,
        ack.error.as_deref(),
        ack.at,
    )?;
    if !found {
        return Err(AppError::NotFound(format!(
            "sync request {} not found",
            ack.request_id
        )));
    }
    info!(
        "Sync request {} acked by {} ({})",
        ack.request_id, ack.client_id, ack.status
    );
    Ok(Json(json!({ "ok": true })))
}

/// POST /client/diagnostics/snapshot
///
/// Store a client's per-unit checksum snapshot for consistency diffing.
async fn record_snapshot(
    State(state): State<AppState>,
    Json(snapshot): Json<ClientSnapshot>,
) -> Result<Json<Value>> {
    state.consistency.record_snapshot(&snapshot)?;
    Ok(Json(json!({ "ok": true, "units": snapshot.units.len() })))
}

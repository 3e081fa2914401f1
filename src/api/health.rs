use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;

use crate::AppState;

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Liveness probe with the current ledger watermark.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let height = state.ledger.height().await;
    let last_seq = state.store.max_seq().unwrap_or(0);
    Json(json!({
        "status": "ok",
        "service": "tally",
        "version": env!("CARGO_PKG_VERSION"),
        "height": height,
        "last_seq": last_seq,
        "clients_seen": state.clients_seen.len(),
    }))
}

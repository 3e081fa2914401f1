//! Consistency reporting endpoint (admin only).

use axum::{extract::State, routing::get, Json, Router};

use crate::error::{AppError, Result};
use crate::types::{Actor, ConsistencyReport};
use crate::AppState;

/// Create the consistency router.
pub fn router() -> Router<AppState> {
    Router::new().route("/report", get(report))
}

/// GET /consistency/report
async fn report(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<ConsistencyReport>> {
    if !actor.role.is_admin() {
        return Err(AppError::PermissionDenied(
            "consistency report requires an admin role".into(),
        ));
    }
    Ok(Json(state.consistency.report()?))
}

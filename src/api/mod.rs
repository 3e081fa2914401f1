pub mod auth;
pub mod client;
pub mod consistency;
pub mod health;
pub mod ledger;
pub mod sync;

use crate::AppState;
use axum::Router;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/sync", sync::router())
        .nest("/ledger", ledger::router())
        .nest("/client", client::router())
        .nest("/consistency", consistency::router())
}

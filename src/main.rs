use std::sync::Arc;
use std::time::Duration;

use tally::config::Config;
use tally::services::SqliteStore;
use tally::{api, AppState};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting tally server on {}:{}", config.host, config.port);

    let store = Arc::new(SqliteStore::new(&config.db_path)?);
    info!("SQLite database initialized at {}", config.db_path);

    let state = AppState::build(config.clone(), store)?;

    // Periodic autoheal sweep over all known clients.
    if config.autoheal.enabled {
        let autoheal = state.autoheal.clone();
        let sweep_interval = Duration::from_millis(config.settings_poll_interval_ms.max(10_000));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                match autoheal.evaluate_all() {
                    Ok(outcomes) => {
                        for (client_id, outcome) in outcomes {
                            if outcome.queued {
                                info!(
                                    "Autoheal queued {} for {}",
                                    outcome.request_type.as_deref().unwrap_or("?"),
                                    client_id
                                );
                            }
                        }
                    }
                    Err(e) => error!("Autoheal sweep failed: {e}"),
                }
            }
        });
    } else {
        info!("Autoheal disabled (AUTOHEAL_ENABLED=0)");
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = api::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("tally server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

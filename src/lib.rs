//! tally - Offline-first replication core: a server-mediated, append-only,
//! signed change ledger with a bidirectional push/pull sync protocol,
//! consistency reporting, and a server-driven client autoheal controller.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod services;
pub mod types;

use std::sync::Arc;

use dashmap::DashMap;

use config::Config;
use services::{
    AutohealController, ConsistencyReporter, LedgerEngine, PullProducer, PushApplier, SqliteStore,
};
use types::ClientInfo;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub ledger: Arc<LedgerEngine>,
    pub push: Arc<PushApplier>,
    pub pull: Arc<PullProducer>,
    pub consistency: Arc<ConsistencyReporter>,
    pub autoheal: Arc<AutohealController>,
    /// Clients observed on the settings poll, by client id.
    pub clients_seen: Arc<DashMap<String, ClientInfo>>,
}

impl AppState {
    /// Wire the full service graph over an existing store.
    pub fn build(config: Arc<Config>, store: Arc<SqliteStore>) -> error::Result<Self> {
        let ledger = Arc::new(LedgerEngine::new(
            store.clone(),
            config.signer_seed.as_deref(),
        )?);
        let push = Arc::new(PushApplier::new(store.clone(), ledger.clone()));
        let pull = Arc::new(PullProducer::new(store.clone(), config.clone()));
        let consistency = Arc::new(ConsistencyReporter::new(store.clone(), config.clone()));
        let autoheal = Arc::new(AutohealController::new(
            store.clone(),
            consistency.clone(),
            config.clone(),
        ));
        Ok(Self {
            config,
            store,
            ledger,
            push,
            pull,
            consistency,
            autoheal,
            clients_seen: Arc::new(DashMap::new()),
        })
    }
}

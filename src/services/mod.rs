pub mod autoheal;
pub mod consistency;
pub mod ledger;
pub mod pull;
pub mod push;
pub mod store;

pub use autoheal::AutohealController;
pub use consistency::ConsistencyReporter;
pub use ledger::LedgerEngine;
pub use pull::PullProducer;
pub use push::PushApplier;
pub use store::SqliteStore;

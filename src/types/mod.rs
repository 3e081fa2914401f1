pub mod consistency;
pub mod ledger;
pub mod row;
pub mod sync;

pub use consistency::*;
pub use ledger::*;
pub use row::*;
pub use sync::*;

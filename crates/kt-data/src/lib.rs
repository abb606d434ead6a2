//! # kt-data
//!
//! Everything kernel-tune reads from or writes to disk outside the tuning
//! loop itself: the shared policy table, the build's dependency files, the
//! source history used to pick kernels, and the per-run ledger.

pub mod changes;
pub mod deps;
pub mod ledger;
pub mod store;

pub use changes::*;
pub use deps::*;
pub use ledger::*;
pub use store::*;

//! SQLite persistence for Trellis.
//!
//! Every state-changing write is guarded by the row's expected current
//! status, so concurrent writers (workers, resume requests, the sweeper)
//! resolve races by one of them observing a no-op.

mod grants;
mod instances;
mod store;
mod sweep;
mod templates;

pub use instances::{InstanceFilter, Transition};
pub use store::SqliteStore;
pub use sweep::{SweptInstance, SweptStep};

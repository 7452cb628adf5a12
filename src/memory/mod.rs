//! In-memory job store and broker.
//!
//! Used by the test suite and by embedders that run workers and submitters
//! in one process. Nothing survives a restart.

mod broker;
mod store;

pub use broker::MemoryBroker;
pub use store::MemoryStore;

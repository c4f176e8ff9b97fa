//! Durable storage for relay state.
//!
//! Every adapter persists a whole [`Snapshot`] per commit, so a failed commit
//! is repaired by the next successful one.

pub mod error;
pub mod json_file;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use relay_core::Snapshot;

/// Narrow persistence interface used by the relay engine.
pub trait PersistentStore: Send + Sync {
    /// Load the last durable state, or an empty snapshot on first run.
    fn load_all(&self) -> Result<Snapshot, StoreError>;

    /// Durably replace the stored state with `state`. On failure the prior
    /// durable state must remain readable by `load_all`.
    fn commit(&self, state: &Snapshot) -> Result<(), StoreError>;

    /// Short adapter name for logs.
    fn name(&self) -> &'static str;
}

//! Ordered key/value storage boundary for the quill document engine.
//!
//! The document layer talks to storage exclusively through the [`Store`] and
//! [`Transaction`] traits: named ordered subtrees, snapshot reads, and
//! single-writer transactions. Backends live behind cargo features:
//!
//! - `memory` (default): persistent-data-structure snapshots, no disk.
//! - `redb`: embedded on-disk B-tree store.

mod error;
mod store;

pub use error::StoreError;
pub use store::{KvIter, Store, StoreOptions, Transaction, increment_prefix};

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "memory")]
pub use memory::{MemoryStore, MemoryTransaction};

#[cfg(feature = "redb")]
mod redb_store;
#[cfg(feature = "redb")]
pub use redb_store::{RedbStore, RedbTransaction};

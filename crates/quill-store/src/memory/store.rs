use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use imbl::OrdMap;

use crate::error::StoreError;
use crate::store::{Store, StoreOptions};

use super::transaction::MemoryTransaction;

pub(crate) type Tree = OrdMap<Vec<u8>, Vec<u8>>;

/// Committed database state. Cloning is O(1) through structural sharing,
/// which is what makes snapshot reads and write working-copies cheap.
#[derive(Clone, Default)]
pub(crate) struct State {
    pub(crate) trees: OrdMap<String, Tree>,
    /// Approximate live size: sum of key + value lengths across all trees.
    pub(crate) bytes: u64,
}

/// In-process backend.
///
/// The whole store is one immutable [`State`] published through an
/// [`ArcSwap`]: readers load it wait-free and keep a consistent view across
/// every subtree, while a mutex serializes writers. A commit publishes the
/// writer's working state in a single atomic swap.
pub struct MemoryStore {
    state: ArcSwap<State>,
    write_lock: Mutex<()>,
    opts: StoreOptions,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default()).expect("default options are valid")
    }

    pub fn with_options(opts: StoreOptions) -> Result<Self, StoreError> {
        opts.validate()?;
        Ok(Self {
            state: ArcSwap::new(Arc::new(State::default())),
            write_lock: Mutex::new(()),
            opts,
        })
    }

    pub(crate) fn options(&self) -> &StoreOptions {
        &self.opts
    }

    /// Snapshot the committed state.
    pub(crate) fn load(&self) -> State {
        (**self.state.load()).clone()
    }

    /// Publish a new committed state. Caller must hold the write lock.
    pub(crate) fn publish(&self, state: State) {
        self.state.store(Arc::new(state));
    }

    pub(crate) fn acquire_write_lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Storage(format!("write lock poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        if read_only {
            Ok(MemoryTransaction::new_read_only(self))
        } else {
            if self.opts.read_only {
                return Err(StoreError::ReadOnly);
            }
            let guard = self.acquire_write_lock()?;
            Ok(MemoryTransaction::new_writable(self, guard))
        }
    }
}

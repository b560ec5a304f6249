use std::sync::MutexGuard;

use crate::error::StoreError;
use crate::store::{KvIter, Transaction};

use super::store::{MemoryStore, State, Tree};

/// A transaction over the memory backend.
///
/// Both read and write transactions hold a full working [`State`]: reads keep
/// the snapshot loaded at `begin`, writes mutate a private copy that becomes
/// visible only at commit. Write transactions additionally hold the store's
/// write lock, so readers never block and writers serialize.
pub struct MemoryTransaction<'a> {
    state: State,
    store: &'a MemoryStore,
    read_only: bool,
    _write_guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new_read_only(store: &'a MemoryStore) -> Self {
        Self {
            state: store.load(),
            store,
            read_only: true,
            _write_guard: None,
        }
    }

    pub(crate) fn new_writable(store: &'a MemoryStore, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            state: store.load(),
            store,
            read_only: false,
            _write_guard: Some(guard),
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    fn tree_ref(&self, name: &str) -> Result<&Tree, StoreError> {
        self.state
            .trees
            .get(name)
            .ok_or_else(|| StoreError::TreeNotFound(name.to_string()))
    }

    fn tree_mut(&mut self, name: &str) -> Result<&mut Tree, StoreError> {
        self.state
            .trees
            .get_mut(name)
            .ok_or_else(|| StoreError::TreeNotFound(name.to_string()))
    }
}

impl<'a> Transaction for MemoryTransaction<'a> {
    type Tree = String;

    fn tree(&self, name: &str) -> Result<Self::Tree, StoreError> {
        self.tree_ref(name)?;
        Ok(name.to_string())
    }

    fn create_tree(&mut self, name: &str) -> Result<Self::Tree, StoreError> {
        self.check_writable()?;
        if !self.state.trees.contains_key(name) {
            if let Some(max) = self.store.options().max_trees {
                if self.state.trees.len() >= max {
                    return Err(StoreError::Config(format!(
                        "subtree limit reached ({max})"
                    )));
                }
            }
            self.state.trees.insert(name.to_string(), Tree::new());
        }
        Ok(name.to_string())
    }

    fn drop_tree(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        if let Some(tree) = self.state.trees.remove(name) {
            let freed: u64 = tree.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
            self.state.bytes = self.state.bytes.saturating_sub(freed);
        }
        Ok(())
    }

    fn get(&self, tree: &Self::Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree_ref(tree)?.get(key).cloned())
    }

    fn scan_prefix<'t>(
        &'t self,
        tree: &Self::Tree,
        prefix: &[u8],
    ) -> Result<KvIter<'t>, StoreError> {
        let data = self.tree_ref(tree)?;
        let prefix = prefix.to_vec();
        Ok(Box::new(
            data.range(prefix.clone()..)
                .take_while(move |(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| Ok((k.clone(), v.clone()))),
        ))
    }

    fn put(&mut self, tree: &Self::Tree, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        let max_bytes = self.store.options().max_bytes;
        let data = self.tree_mut(tree)?;
        let old = data.get(key).map(|v| (key.len() + v.len()) as u64);
        let new = (key.len() + value.len()) as u64;
        let bytes = self.state.bytes - old.unwrap_or(0) + new;
        if let Some(max) = max_bytes {
            if bytes > max {
                return Err(StoreError::Storage(format!(
                    "store is full ({bytes} > {max} bytes)"
                )));
            }
        }
        let data = self.tree_mut(tree)?;
        data.insert(key.to_vec(), value.to_vec());
        self.state.bytes = bytes;
        Ok(())
    }

    fn delete(&mut self, tree: &Self::Tree, key: &[u8]) -> Result<bool, StoreError> {
        self.check_writable()?;
        let data = self.tree_mut(tree)?;
        match data.remove(key) {
            Some(old) => {
                self.state.bytes = self
                    .state
                    .bytes
                    .saturating_sub((key.len() + old.len()) as u64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(self) -> Result<(), StoreError> {
        if !self.read_only {
            self.store.publish(self.state);
        }
        Ok(())
    }

    fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{Store, StoreOptions, Transaction};

    use super::super::MemoryStore;

    fn write_entry(store: &MemoryStore, tree: &str, key: &[u8], value: &[u8]) {
        let mut txn = store.begin(false).unwrap();
        let t = txn.create_tree(tree).unwrap();
        txn.put(&t, key, value).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn committed_writes_are_visible() {
        let store = MemoryStore::new();
        write_entry(&store, "t", b"k", b"v");

        let txn = store.begin(true).unwrap();
        let t = txn.tree("t").unwrap();
        assert_eq!(txn.get(&t, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        write_entry(&store, "t", b"k", b"v1");

        let reader = store.begin(true).unwrap();
        let rt = reader.tree("t").unwrap();

        {
            let mut txn = store.begin(false).unwrap();
            let t = txn.tree("t").unwrap();
            txn.put(&t, b"k", b"v2").unwrap();
            // dropped without commit
            drop(txn);
        }

        assert_eq!(reader.get(&rt, b"k").unwrap(), Some(b"v1".to_vec()));
        let fresh = store.begin(true).unwrap();
        let ft = fresh.tree("t").unwrap();
        assert_eq!(fresh.get(&ft, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn snapshot_does_not_observe_later_commit() {
        let store = MemoryStore::new();
        write_entry(&store, "t", b"k", b"v1");

        let reader = store.begin(true).unwrap();
        let rt = reader.tree("t").unwrap();
        write_entry(&store, "t", b"k", b"v2");

        // The snapshot predates the second commit.
        assert_eq!(reader.get(&rt, b"k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn write_transaction_reads_its_own_writes() {
        let store = MemoryStore::new();
        let mut txn = store.begin(false).unwrap();
        let t = txn.create_tree("t").unwrap();
        txn.put(&t, b"k", b"v").unwrap();
        assert_eq!(txn.get(&t, b"k").unwrap(), Some(b"v".to_vec()));
        let found: Vec<_> = txn.scan_prefix(&t, b"").unwrap().collect();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        let mut txn = store.begin(false).unwrap();
        let t = txn.create_tree("t").unwrap();
        txn.put(&t, b"a:2", b"2").unwrap();
        txn.put(&t, b"a:1", b"1").unwrap();
        txn.put(&t, b"b:1", b"x").unwrap();
        txn.commit().unwrap();

        let txn = store.begin(true).unwrap();
        let t = txn.tree("t").unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan_prefix(&t, b"a:")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"a:1".to_vec(), b"a:2".to_vec()]);
    }

    #[test]
    fn dropped_tree_vanishes_with_commit() {
        let store = MemoryStore::new();
        write_entry(&store, "t", b"k", b"v");

        let mut txn = store.begin(false).unwrap();
        txn.drop_tree("t").unwrap();
        txn.commit().unwrap();

        let txn = store.begin(true).unwrap();
        assert!(txn.tree("t").is_err());
    }

    #[test]
    fn read_only_store_rejects_writers() {
        let store = MemoryStore::with_options(StoreOptions {
            read_only: true,
            ..StoreOptions::default()
        })
        .unwrap();
        assert!(store.begin(false).is_err());
        assert!(store.begin(true).is_ok());
    }

    #[test]
    fn max_trees_enforced() {
        let store = MemoryStore::with_options(StoreOptions {
            max_trees: Some(1),
            ..StoreOptions::default()
        })
        .unwrap();
        let mut txn = store.begin(false).unwrap();
        txn.create_tree("a").unwrap();
        assert!(txn.create_tree("b").is_err());
    }

    #[test]
    fn max_bytes_enforced() {
        let store = MemoryStore::with_options(StoreOptions {
            max_bytes: Some(8),
            ..StoreOptions::default()
        })
        .unwrap();
        let mut txn = store.begin(false).unwrap();
        let t = txn.create_tree("t").unwrap();
        txn.put(&t, b"k", b"v").unwrap();
        assert!(txn.put(&t, b"key2", b"a-much-longer-value").is_err());
    }
}

use crate::error::StoreError;

/// Engine configuration accepted by `open`.
///
/// `max_bytes` and `max_trees` bound the backend where it can enforce them;
/// `read_only` makes every write transaction fail with [`StoreError::ReadOnly`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub max_bytes: Option<u64>,
    pub max_trees: Option<usize>,
    pub read_only: bool,
}

impl StoreOptions {
    /// Reject configurations no backend can honor.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_bytes == Some(0) {
            return Err(StoreError::Config("max_bytes must be non-zero".into()));
        }
        if self.max_trees == Some(0) {
            return Err(StoreError::Config("max_trees must be non-zero".into()));
        }
        Ok(())
    }
}

/// Iterator over `(key, value)` pairs in key order.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a>;

/// An ordered, transactional key/value store with named subtrees.
///
/// Transactions are single-writer, multi-reader: `begin(false)` blocks until
/// the writer slot is free; `begin(true)` returns a consistent snapshot and
/// never blocks writers.
pub trait Store {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError>;
}

/// One transaction over the store.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// discards every change (write transactions abort).
pub trait Transaction {
    /// Resolved subtree handle. Cheap to clone.
    type Tree: Clone;

    /// Resolve an existing subtree.
    ///
    /// # Errors
    ///
    /// [`StoreError::TreeNotFound`] if the subtree has not been created.
    fn tree(&self, name: &str) -> Result<Self::Tree, StoreError>;

    /// Create a subtree (idempotent) and return its handle.
    /// The creation commits or aborts with the transaction.
    fn create_tree(&mut self, name: &str) -> Result<Self::Tree, StoreError>;

    /// Remove a subtree and all its entries.
    fn drop_tree(&mut self, name: &str) -> Result<(), StoreError>;

    fn get(&self, tree: &Self::Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Iterate all entries whose key starts with `prefix`, in key order.
    /// An empty prefix scans the whole subtree.
    fn scan_prefix<'a>(&'a self, tree: &Self::Tree, prefix: &[u8])
    -> Result<KvIter<'a>, StoreError>;

    fn put(&mut self, tree: &Self::Tree, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete a key. Returns whether the key existed.
    fn delete(&mut self, tree: &Self::Tree, key: &[u8]) -> Result<bool, StoreError>;

    fn commit(self) -> Result<(), StoreError>;
    fn rollback(self) -> Result<(), StoreError>;
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is all `0xFF` (scan to the end).
pub fn increment_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_simple() {
        assert_eq!(increment_prefix(b"abc"), Some(b"abd".to_vec()));
    }

    #[test]
    fn increment_carries_past_ff() {
        assert_eq!(increment_prefix(&[0x61, 0xFF]), Some(vec![0x62]));
    }

    #[test]
    fn increment_all_ff_is_unbounded() {
        assert_eq!(increment_prefix(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn options_reject_zero_limits() {
        let opts = StoreOptions {
            max_trees: Some(0),
            ..StoreOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}

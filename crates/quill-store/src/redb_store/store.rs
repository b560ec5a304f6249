use std::path::Path;

use redb::Database;

use crate::error::StoreError;
use crate::store::{Store, StoreOptions};

use super::transaction::RedbTransaction;

/// On-disk backend over a single redb database file.
///
/// Each named subtree maps to one redb table. Snapshot isolation, the
/// single-writer discipline, and durability are redb's own: a read
/// transaction pins a committed root, and `begin_write` blocks until the
/// previous writer finishes.
pub struct RedbStore {
    db: Database,
    opts: StoreOptions,
}

impl RedbStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path, opts: StoreOptions) -> Result<Self, StoreError> {
        opts.validate()?;
        let db = if opts.read_only {
            Database::open(path).map_err(|e| StoreError::Io(e.to_string()))?
        } else {
            Database::create(path).map_err(|e| StoreError::Io(e.to_string()))?
        };
        Ok(Self { db, opts })
    }
}

impl Store for RedbStore {
    type Txn<'a> = RedbTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        if !read_only && self.opts.read_only {
            return Err(StoreError::ReadOnly);
        }
        RedbTransaction::new(&self.db, read_only)
    }
}

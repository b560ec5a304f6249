use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::{KvIter, Transaction, increment_prefix};

enum Inner {
    Read(redb::ReadTransaction),
    Write(redb::WriteTransaction),
    Consumed,
}

pub struct RedbTransaction<'db> {
    inner: Inner,
    #[allow(dead_code)]
    db: &'db Database,
    read_only: bool,
}

fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn table_err(name: &str, e: redb::TableError) -> StoreError {
    match e {
        redb::TableError::TableDoesNotExist(_) => StoreError::TreeNotFound(name.to_string()),
        other => StoreError::Storage(other.to_string()),
    }
}

impl<'db> RedbTransaction<'db> {
    pub(crate) fn new(db: &'db Database, read_only: bool) -> Result<Self, StoreError> {
        let inner = if read_only {
            Inner::Read(db.begin_read().map_err(storage_err)?)
        } else {
            Inner::Write(db.begin_write().map_err(storage_err)?)
        };
        Ok(Self {
            inner,
            db,
            read_only,
        })
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Eagerly collect prefix entries inside a write transaction, where the
    /// table handle's lifetime forbids returning a lazy iterator.
    fn collect_prefix_write(
        txn: &redb::WriteTransaction,
        tree: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(tree);
        let table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
        let upper = increment_prefix(prefix);

        let range = if let Some(ref upper) = upper {
            table.range::<&[u8]>(prefix..upper.as_slice())
        } else {
            table.range::<&[u8]>(prefix..)
        }
        .map_err(storage_err)?;

        let mut entries = Vec::new();
        for entry in range {
            let (k, v) = entry.map_err(storage_err)?;
            entries.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(entries)
    }
}

impl<'db> Transaction for RedbTransaction<'db> {
    type Tree = String;

    fn tree(&self, name: &str) -> Result<Self::Tree, StoreError> {
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(name);
        match &self.inner {
            Inner::Read(txn) => {
                txn.open_table(def).map_err(|e| table_err(name, e))?;
            }
            // Opening a table in a write transaction creates it if missing;
            // the catalog layer above only resolves trees it knows exist.
            Inner::Write(txn) => {
                txn.open_table(def).map_err(|e| table_err(name, e))?;
            }
            Inner::Consumed => return Err(StoreError::TransactionConsumed),
        }
        Ok(name.to_string())
    }

    fn create_tree(&mut self, name: &str) -> Result<Self::Tree, StoreError> {
        self.check_writable()?;
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(name);
        match &self.inner {
            Inner::Write(txn) => {
                txn.open_table(def).map_err(|e| table_err(name, e))?;
                Ok(name.to_string())
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
            _ => Err(StoreError::ReadOnly),
        }
    }

    fn drop_tree(&mut self, name: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(name);
        match &self.inner {
            Inner::Write(txn) => {
                txn.delete_table(def).map_err(storage_err)?;
                Ok(())
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
            _ => Err(StoreError::ReadOnly),
        }
    }

    fn get(&self, tree: &Self::Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(tree);
        match &self.inner {
            Inner::Read(txn) => {
                let table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
                let value = table.get(key).map_err(storage_err)?;
                Ok(value.map(|v| v.value().to_vec()))
            }
            Inner::Write(txn) => {
                let table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
                let value = table.get(key).map_err(storage_err)?;
                Ok(value.map(|v| v.value().to_vec()))
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
        }
    }

    fn scan_prefix<'a>(
        &'a self,
        tree: &Self::Tree,
        prefix: &[u8],
    ) -> Result<KvIter<'a>, StoreError> {
        match &self.inner {
            Inner::Read(txn) => {
                // ReadOnlyTable::range() returns an owned, ref-counted range,
                // so the iterator can outlive the table handle.
                let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(tree);
                let table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
                let range = table.range::<&[u8]>(prefix..).map_err(storage_err)?;
                let prefix_owned = prefix.to_vec();
                Ok(Box::new(
                    range
                        .take_while(move |entry| match entry {
                            Ok((k, _)) => k.value().starts_with(&prefix_owned),
                            Err(_) => true,
                        })
                        .map(|entry| {
                            let (k, v) = entry.map_err(storage_err)?;
                            Ok((k.value().to_vec(), v.value().to_vec()))
                        }),
                ))
            }
            Inner::Write(txn) => {
                let entries = Self::collect_prefix_write(txn, tree, prefix)?;
                Ok(Box::new(entries.into_iter().map(Ok)))
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
        }
    }

    fn put(&mut self, tree: &Self::Tree, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_writable()?;
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(tree);
        match &self.inner {
            Inner::Write(txn) => {
                let mut table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
                table.insert(key, value).map_err(storage_err)?;
                Ok(())
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
            _ => Err(StoreError::ReadOnly),
        }
    }

    fn delete(&mut self, tree: &Self::Tree, key: &[u8]) -> Result<bool, StoreError> {
        self.check_writable()?;
        let def: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new(tree);
        match &self.inner {
            Inner::Write(txn) => {
                let mut table = txn.open_table(def).map_err(|e| table_err(tree, e))?;
                let removed = table.remove(key).map_err(storage_err)?;
                Ok(removed.is_some())
            }
            Inner::Consumed => Err(StoreError::TransactionConsumed),
            _ => Err(StoreError::ReadOnly),
        }
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let inner = std::mem::replace(&mut self.inner, Inner::Consumed);
        match inner {
            Inner::Write(txn) => txn.commit().map_err(storage_err),
            Inner::Read(_) => Ok(()),
            Inner::Consumed => Err(StoreError::TransactionConsumed),
        }
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        let inner = std::mem::replace(&mut self.inner, Inner::Consumed);
        match inner {
            Inner::Write(txn) => {
                txn.abort().map_err(storage_err)?;
                Ok(())
            }
            Inner::Read(_) => Ok(()),
            Inner::Consumed => Err(StoreError::TransactionConsumed),
        }
    }
}

//! Collection and index metadata.
//!
//! One dedicated `_sys` subtree holds a schema record per collection
//! (`schema:<collection>`) and one descriptor per index
//! (`idx:<collection>:<name>`). Both are serialized with the same BSON codec
//! as user documents.

use serde::{Deserialize, Serialize};

use quill_store::Transaction;

use crate::error::{DbError, Result};

pub const SYS_TREE: &str = "_sys";

const SCHEMA_PREFIX: &[u8] = b"schema:";
const IDX_PREFIX: &[u8] = b"idx:";

/// Sort / index key direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// The numeric form used in default index names (`+1` / `-1`).
    fn numeric(self) -> i32 {
        match self {
            Direction::Asc => 1,
            Direction::Desc => -1,
        }
    }
}

/// One field of an index key spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    pub field: String,
    pub direction: Direction,
}

impl IndexField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

/// Persistent descriptor of a secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexField>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexSpec {
    /// Default index name: `<field>_<dir>` components joined by `_`,
    /// e.g. `status_1_age_-1`.
    pub fn default_name(keys: &[IndexField]) -> String {
        let parts: Vec<String> = keys
            .iter()
            .map(|k| format!("{}_{}", k.field, k.direction.numeric()))
            .collect();
        parts.join("_")
    }
}

/// Per-collection schema record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub doc_count: i64,
    pub id_counter: i64,
}

fn schema_key(collection: &str) -> Vec<u8> {
    let mut key = SCHEMA_PREFIX.to_vec();
    key.extend_from_slice(collection.as_bytes());
    key
}

fn idx_key(collection: &str, name: &str) -> Vec<u8> {
    let mut key = IDX_PREFIX.to_vec();
    key.extend_from_slice(collection.as_bytes());
    key.push(b':');
    key.extend_from_slice(name.as_bytes());
    key
}

fn idx_collection_prefix(collection: &str) -> Vec<u8> {
    let mut key = IDX_PREFIX.to_vec();
    key.extend_from_slice(collection.as_bytes());
    key.push(b':');
    key
}

pub struct Catalog;

impl Catalog {
    // ── Schema records ──────────────────────────────────────────

    pub fn read_schema<T: Transaction>(
        &self,
        txn: &T,
        sys: &T::Tree,
        collection: &str,
    ) -> Result<Option<SchemaRecord>> {
        match txn.get(sys, &schema_key(collection))? {
            Some(bytes) => Ok(Some(bson::deserialize_from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_schema<T: Transaction>(
        &self,
        txn: &mut T,
        sys: &T::Tree,
        collection: &str,
        record: &SchemaRecord,
    ) -> Result<()> {
        let bytes = bson::serialize_to_vec(record)?;
        txn.put(sys, &schema_key(collection), &bytes)?;
        Ok(())
    }

    pub fn delete_schema<T: Transaction>(
        &self,
        txn: &mut T,
        sys: &T::Tree,
        collection: &str,
    ) -> Result<()> {
        txn.delete(sys, &schema_key(collection))?;
        Ok(())
    }

    pub fn list_collections<T: Transaction>(
        &self,
        txn: &T,
        sys: &T::Tree,
    ) -> Result<Vec<String>> {
        let mut collections = Vec::new();
        for entry in txn.scan_prefix(sys, SCHEMA_PREFIX)? {
            let (key, _) = entry.map_err(DbError::from)?;
            if let Some(name) = key.strip_prefix(SCHEMA_PREFIX) {
                if let Ok(s) = std::str::from_utf8(name) {
                    collections.push(s.to_string());
                }
            }
        }
        Ok(collections)
    }

    // ── Index descriptors ───────────────────────────────────────

    pub fn read_index<T: Transaction>(
        &self,
        txn: &T,
        sys: &T::Tree,
        collection: &str,
        name: &str,
    ) -> Result<Option<IndexSpec>> {
        match txn.get(sys, &idx_key(collection, name))? {
            Some(bytes) => Ok(Some(bson::deserialize_from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_index<T: Transaction>(
        &self,
        txn: &mut T,
        sys: &T::Tree,
        collection: &str,
        spec: &IndexSpec,
    ) -> Result<()> {
        let bytes = bson::serialize_to_vec(spec)?;
        txn.put(sys, &idx_key(collection, &spec.name), &bytes)?;
        Ok(())
    }

    pub fn delete_index<T: Transaction>(
        &self,
        txn: &mut T,
        sys: &T::Tree,
        collection: &str,
        name: &str,
    ) -> Result<bool> {
        Ok(txn.delete(sys, &idx_key(collection, name))?)
    }

    pub fn list_indexes<T: Transaction>(
        &self,
        txn: &T,
        sys: &T::Tree,
        collection: &str,
    ) -> Result<Vec<IndexSpec>> {
        let prefix = idx_collection_prefix(collection);
        let mut specs = Vec::new();
        for entry in txn.scan_prefix(sys, &prefix)? {
            let (_, value) = entry.map_err(DbError::from)?;
            specs.push(bson::deserialize_from_slice(&value)?);
        }
        Ok(specs)
    }
}

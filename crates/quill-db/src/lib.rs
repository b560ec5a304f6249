//! Embedded, single-process document database: a MongoDB-style document API
//! over an ordered key/value store.
//!
//! Documents are BSON (`bson::Document`), stored verbatim in a per-collection
//! primary tree keyed by `_id`. Secondary indexes are duplicate-sorted trees
//! mapping a composite key of the indexed field values to the primary key;
//! the planner uses them to avoid full scans, and every candidate is
//! re-checked by the matcher.
//!
//! ```
//! use bson::doc;
//! use quill_db::{Database, DatabaseOptions, FindOptions};
//!
//! let db = Database::open_in_memory(DatabaseOptions::default())?;
//! db.insert_one("users", doc! { "_id": 1, "email": "a@x", "age": 30 })?;
//! db.insert_one("users", doc! { "_id": 2, "email": "b@x", "age": 40 })?;
//!
//! db.create_index("users", vec![quill_db::IndexField::asc("email")], None, true, false)?;
//!
//! let found = db.find_one("users", &doc! { "email": "b@x" }, &FindOptions::new())?;
//! assert_eq!(found.unwrap().get_i32("_id")?, 2);
//!
//! let adults = db.count("users", Some(&doc! { "age": { "$gte": 35 } }))?;
//! assert_eq!(adults, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod catalog;
mod database;
mod encoding;
mod error;
mod executor;
mod filter;
mod matcher;
mod mutation;
mod order;
mod planner;

pub use catalog::{Direction, IndexField, IndexSpec};
pub use database::{
    Database, DatabaseOptions, DeleteResult, ReadTransaction, UpdateResult, WriteTransaction,
};
pub use error::{DbError, Result};
pub use executor::{Cursor, FindOptions, Sort};

pub use quill_store::{Store, StoreError, StoreOptions, Transaction};

#[cfg(feature = "memory")]
pub use quill_store::MemoryStore;

#[cfg(feature = "redb")]
pub use quill_store::RedbStore;

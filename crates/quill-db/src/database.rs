//! The database handle.
//!
//! `Database` owns the storage engine, a single writer mutex, the regex
//! cache, and a per-collection cache of document counts and index
//! descriptors. Every CRUD call scopes one storage transaction that covers
//! the primary tree, every affected index tree, and the metadata record, so
//! index maintenance commits or aborts atomically with the data write.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bson::oid::ObjectId;
use bson::{Bson, Document};

use quill_store::{Store, StoreError, StoreOptions, Transaction};

use crate::catalog::{Catalog, IndexField, IndexSpec, SYS_TREE, SchemaRecord};
use crate::encoding;
use crate::error::{DbError, Result};
use crate::executor::{self, Cursor, FindOptions};
use crate::filter::{self, Filter, RegexCache};
use crate::matcher;
use crate::mutation::{self, UpdateDoc};
use crate::order;
use crate::planner;

/// Configuration accepted by `open`.
#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    pub max_bytes: Option<u64>,
    pub max_trees: Option<usize>,
    pub read_only: bool,
}

impl DatabaseOptions {
    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_bytes: self.max_bytes,
            max_trees: self.max_trees,
            read_only: self.read_only,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteResult {
    pub deleted: u64,
}

#[derive(Clone)]
struct CollectionInfo {
    count: i64,
    indexes: Arc<Vec<IndexSpec>>,
}

pub struct Database<S: Store> {
    store: S,
    catalog: Catalog,
    regex_cache: RegexCache,
    /// Cached per-collection state, republished after each committed write.
    collections: ArcSwap<HashMap<String, CollectionInfo>>,
    /// Serializes writers at the handle level; storage transactions are
    /// begun only while this is held.
    writer: Mutex<()>,
    closed: AtomicBool,
}

#[cfg(feature = "memory")]
impl Database<quill_store::MemoryStore> {
    /// Open a fresh in-process database.
    pub fn open_in_memory(options: DatabaseOptions) -> Result<Self> {
        let store = quill_store::MemoryStore::with_options(options.store_options())?;
        Self::with_store(store)
    }
}

#[cfg(feature = "redb")]
impl Database<quill_store::RedbStore> {
    const DATA_FILE: &'static str = "quill.redb";

    /// Open (or create) a database directory on disk.
    pub fn open(path: impl AsRef<std::path::Path>, options: DatabaseOptions) -> Result<Self> {
        let dir = path.as_ref();
        if !options.read_only {
            std::fs::create_dir_all(dir)
                .map_err(|e| DbError::Storage(StoreError::Io(e.to_string())))?;
        }
        let store = quill_store::RedbStore::open(&dir.join(Self::DATA_FILE), options.store_options())?;
        Self::with_store(store)
    }
}

impl<S: Store> Database<S> {
    /// Wrap an already-opened storage engine.
    pub fn with_store(store: S) -> Result<Self> {
        let db = Self {
            store,
            catalog: Catalog,
            regex_cache: RegexCache::default(),
            collections: ArcSwap::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        match self.store.begin(false) {
            Ok(mut txn) => {
                txn.create_tree(SYS_TREE)?;
                txn.commit()?;
            }
            Err(StoreError::ReadOnly) => {}
            Err(e) => return Err(e.into()),
        }

        let txn = self.store.begin(true)?;
        let sys = match txn.tree(SYS_TREE) {
            Ok(sys) => sys,
            Err(StoreError::TreeNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut map = HashMap::new();
        for name in self.catalog.list_collections(&txn, &sys)? {
            let schema = self
                .catalog
                .read_schema(&txn, &sys, &name)?
                .ok_or_else(|| DbError::Corrupt(format!("missing schema for '{name}'")))?;
            let indexes = self.catalog.list_indexes(&txn, &sys, &name)?;
            map.insert(
                name,
                CollectionInfo {
                    count: schema.doc_count,
                    indexes: Arc::new(indexes),
                },
            );
        }
        self.collections.store(Arc::new(map));
        Ok(())
    }

    /// Mark the handle closed. Idempotent; later operations fail with
    /// [`DbError::Closed`]. Open cursors and read transactions keep working
    /// until dropped.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|e| DbError::Storage(StoreError::Storage(format!("writer poisoned: {e}"))))
    }

    fn info(&self, collection: &str) -> Option<CollectionInfo> {
        self.collections.load().get(collection).cloned()
    }

    /// Re-read one collection's cached state from the store. Called with
    /// the writer lock held, after a successful commit.
    fn refresh_collection_cache(&self, collection: &str) -> Result<()> {
        let txn = self.store.begin(true)?;
        let sys = txn.tree(SYS_TREE)?;
        let mut map = (**self.collections.load()).clone();
        match self.catalog.read_schema(&txn, &sys, collection)? {
            Some(schema) => {
                let indexes = self.catalog.list_indexes(&txn, &sys, collection)?;
                map.insert(
                    collection.to_string(),
                    CollectionInfo {
                        count: schema.doc_count,
                        indexes: Arc::new(indexes),
                    },
                );
            }
            None => {
                map.remove(collection);
            }
        }
        self.collections.store(Arc::new(map));
        Ok(())
    }

    // ── Collections ─────────────────────────────────────────────

    /// Create a collection. Success is idempotent when it already exists.
    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.check_open()?;
        validate_collection_name(name)?;
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        self.ensure_collection(&mut txn, name)?;
        txn.commit()?;
        self.refresh_collection_cache(name)
    }

    /// Drop a collection: primary tree, every index tree, and all metadata.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let sys = txn.create_tree(SYS_TREE)?;
        if self.catalog.read_schema(&txn, &sys, name)?.is_none() {
            return Err(DbError::NotFound(format!("collection '{name}'")));
        }
        for index in self.catalog.list_indexes(&txn, &sys, name)? {
            txn.drop_tree(&encoding::index_tree(name, &index.name))?;
            self.catalog.delete_index(&mut txn, &sys, name, &index.name)?;
        }
        txn.drop_tree(&encoding::collection_tree(name))?;
        self.catalog.delete_schema(&mut txn, &sys, name)?;
        txn.commit()?;
        self.refresh_collection_cache(name)
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.collections.load().contains_key(name))
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut names: Vec<String> = self.collections.load().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Document count. With no filter (or an empty one) this is the cached
    /// count maintained by writers; otherwise the filter is planned and the
    /// matches are counted.
    pub fn count(&self, collection: &str, filter: Option<&Document>) -> Result<i64> {
        self.check_open()?;
        if filter.is_none_or(|f| f.is_empty()) {
            return Ok(self.info(collection).map(|i| i.count).unwrap_or(0));
        }
        let filter = filter.expect("checked above");
        let txn = self.store.begin(true)?;
        let cursor = self.query(&txn, collection, filter, &FindOptions::new())?;
        let mut count = 0i64;
        for doc in cursor {
            doc?;
            count += 1;
        }
        Ok(count)
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Run a find and collect the results.
    pub fn find(
        &self,
        collection: &str,
        filter: &Document,
        opts: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.check_open()?;
        let txn = self.store.begin(true)?;
        let cursor = self.query(&txn, collection, filter, opts)?;
        cursor.collect()
    }

    /// First matching document, if any.
    pub fn find_one(
        &self,
        collection: &str,
        filter: &Document,
        opts: &FindOptions,
    ) -> Result<Option<Document>> {
        let mut opts = opts.clone();
        opts.limit = Some(1);
        Ok(self.find(collection, filter, &opts)?.into_iter().next())
    }

    /// Distinct values of `field` across matching documents; array values
    /// contribute their elements. Results come back ordered by the
    /// cross-type comparator.
    pub fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: Option<&Document>,
    ) -> Result<Vec<Bson>> {
        self.check_open()?;
        let empty = Document::new();
        let txn = self.store.begin(true)?;
        let cursor = self.query(&txn, collection, filter.unwrap_or(&empty), &FindOptions::new())?;
        let mut values = Vec::new();
        for doc in cursor {
            let doc = doc?;
            match matcher::get_path(&doc, field) {
                Some(Bson::Array(arr)) => values.extend(arr.iter().cloned()),
                Some(v) => values.push(v.clone()),
                None => {}
            }
        }
        values.sort_by(order::compare);
        values.dedup_by(|a, b| order::values_equal(a, b));
        Ok(values)
    }

    /// Open a read snapshot for lazy cursors.
    pub fn begin_read(&self) -> Result<ReadTransaction<'_, S>> {
        self.check_open()?;
        Ok(ReadTransaction {
            db: self,
            txn: self.store.begin(true)?,
        })
    }

    /// Open an explicit write transaction. Acquires the writer mutex —
    /// blocks while another writer is active — and holds it until commit,
    /// rollback, or drop (drop aborts).
    pub fn begin_write(&self) -> Result<WriteTransaction<'_, S>> {
        self.check_open()?;
        let guard = self.lock_writer()?;
        Ok(WriteTransaction {
            db: self,
            txn: self.store.begin(false)?,
            touched: HashSet::new(),
            _guard: guard,
        })
    }

    fn query<'a, T: Transaction>(
        &self,
        txn: &'a T,
        collection: &str,
        filter_doc: &Document,
        opts: &FindOptions,
    ) -> Result<Cursor<'a, T>> {
        let filter = filter::compile(filter_doc, &self.regex_cache)?;
        let indexes = match self.info(collection) {
            Some(info) => info.indexes,
            None => return Ok(Cursor::empty()),
        };
        let plan = planner::plan(&filter, &indexes);
        executor::execute(txn, collection, plan, filter, opts)
    }

    /// Like [`query`](Self::query), but resolves the collection through the
    /// transaction's own catalog state instead of the handle cache, so write
    /// transactions see collections and indexes they created themselves.
    fn query_in_txn<'a, T: Transaction>(
        &self,
        txn: &'a T,
        collection: &str,
        filter_doc: &Document,
        opts: &FindOptions,
    ) -> Result<Cursor<'a, T>> {
        let filter = filter::compile(filter_doc, &self.regex_cache)?;
        let sys = match txn.tree(SYS_TREE) {
            Ok(sys) => sys,
            Err(StoreError::TreeNotFound(_)) => return Ok(Cursor::empty()),
            Err(e) => return Err(e.into()),
        };
        if self.catalog.read_schema(txn, &sys, collection)?.is_none() {
            return Ok(Cursor::empty());
        }
        let indexes = self.catalog.list_indexes(txn, &sys, collection)?;
        let plan = planner::plan(&filter, &indexes);
        executor::execute(txn, collection, plan, filter, opts)
    }

    // ── Inserts ─────────────────────────────────────────────────

    /// Insert one document, returning its `_id` (generated when absent).
    pub fn insert_one(&self, collection: &str, doc: Document) -> Result<Bson> {
        self.check_open()?;
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let id = self.insert_in_txn(&mut txn, collection, doc)?;
        txn.commit()?;
        self.refresh_collection_cache(collection)?;
        Ok(id)
    }

    /// Insert a batch inside one transaction; any failure rolls the whole
    /// batch back.
    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<Bson>> {
        self.check_open()?;
        if docs.is_empty() {
            return Err(DbError::Invalid("empty insert batch".into()));
        }
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_in_txn(&mut txn, collection, doc)?);
        }
        txn.commit()?;
        self.refresh_collection_cache(collection)?;
        Ok(ids)
    }

    fn insert_in_txn<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        doc: Document,
    ) -> Result<Bson> {
        let (sys, primary, mut schema, indexes) = self.ensure_collection(txn, collection)?;

        let (doc, id, generated) = normalize_id(doc)?;
        let id_key = encoding::primary_key(&id);
        if txn.get(&primary, &id_key)?.is_some() {
            return Err(DbError::DuplicateId(id.to_string()));
        }

        let bytes = bson::serialize_to_vec(&doc)?;
        txn.put(&primary, &id_key, &bytes)?;
        self.insert_index_entries(txn, collection, &indexes, &doc, &id_key)?;

        schema.doc_count += 1;
        if generated {
            schema.id_counter += 1;
        }
        self.catalog.write_schema(txn, &sys, collection, &schema)?;
        Ok(id)
    }

    // ── Updates ─────────────────────────────────────────────────

    pub fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.update_impl(collection, filter, update, upsert, Some(1))
    }

    pub fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.update_impl(collection, filter, update, upsert, None)
    }

    /// Replace the first matching document wholesale. The replacement must
    /// not contain update operators.
    pub fn replace_one(
        &self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(DbError::BadUpdate(
                "replacement document cannot contain operators".into(),
            ));
        }
        self.update_impl(collection, filter, replacement, upsert, Some(1))
    }

    fn update_impl(
        &self,
        collection: &str,
        filter_doc: &Document,
        update_doc: &Document,
        upsert: bool,
        limit: Option<usize>,
    ) -> Result<UpdateResult> {
        self.check_open()?;
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let result = self.update_in_txn(&mut txn, collection, filter_doc, update_doc, upsert, limit)?;
        txn.commit()?;
        self.refresh_collection_cache(collection)?;
        Ok(result)
    }

    fn update_in_txn<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        filter_doc: &Document,
        update_doc: &Document,
        upsert: bool,
        limit: Option<usize>,
    ) -> Result<UpdateResult> {
        let parsed = mutation::parse_update(update_doc, &self.regex_cache)?;
        let filter = filter::compile(filter_doc, &self.regex_cache)?;
        let sys = txn.create_tree(SYS_TREE)?;

        let schema = self.catalog.read_schema(txn, &sys, collection)?;
        if schema.is_none() && !upsert {
            return Ok(UpdateResult::default());
        }

        let indexes = self.catalog.list_indexes(txn, &sys, collection)?;
        let matches = self.collect_matches(txn, collection, &filter, &indexes, limit)?;

        if matches.is_empty() {
            if !upsert {
                return Ok(UpdateResult::default());
            }
            let new_doc = synthesize_upsert(filter_doc, &parsed)?;
            let id = self.insert_in_txn(txn, collection, new_doc)?;
            return Ok(UpdateResult {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            });
        }

        let primary = txn.tree(&encoding::collection_tree(collection))?;
        let matched = matches.len() as u64;
        let mut modified = 0u64;

        for old in &matches {
            let id = old
                .get("_id")
                .cloned()
                .ok_or_else(|| DbError::Corrupt("stored document missing _id".into()))?;

            let new_doc = match &parsed {
                UpdateDoc::Replacement(body) => build_replacement(&id, body)?,
                UpdateDoc::Operators(update) => update.apply(old)?,
            };
            if new_doc == *old {
                continue;
            }

            let id_key = encoding::primary_key(&id);
            self.reindex_document(txn, collection, &indexes, old, &new_doc, &id_key)?;
            txn.put(&primary, &id_key, &bson::serialize_to_vec(&new_doc)?)?;
            modified += 1;
        }

        Ok(UpdateResult {
            matched,
            modified,
            upserted_id: None,
        })
    }

    // ── Deletes ─────────────────────────────────────────────────

    pub fn delete_one(&self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        self.delete_impl(collection, filter, Some(1))
    }

    pub fn delete_many(&self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        self.delete_impl(collection, filter, None)
    }

    fn delete_impl(
        &self,
        collection: &str,
        filter_doc: &Document,
        limit: Option<usize>,
    ) -> Result<DeleteResult> {
        self.check_open()?;
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let result = self.delete_in_txn(&mut txn, collection, filter_doc, limit)?;
        txn.commit()?;
        self.refresh_collection_cache(collection)?;
        Ok(result)
    }

    fn delete_in_txn<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        filter_doc: &Document,
        limit: Option<usize>,
    ) -> Result<DeleteResult> {
        let filter = filter::compile(filter_doc, &self.regex_cache)?;
        let sys = txn.create_tree(SYS_TREE)?;

        let Some(mut schema) = self.catalog.read_schema(txn, &sys, collection)? else {
            return Ok(DeleteResult { deleted: 0 });
        };
        let indexes = self.catalog.list_indexes(txn, &sys, collection)?;
        let matches = self.collect_matches(txn, collection, &filter, &indexes, limit)?;
        if matches.is_empty() {
            return Ok(DeleteResult { deleted: 0 });
        }

        let primary = txn.tree(&encoding::collection_tree(collection))?;
        for doc in &matches {
            let id = doc
                .get("_id")
                .cloned()
                .ok_or_else(|| DbError::Corrupt("stored document missing _id".into()))?;
            let id_key = encoding::primary_key(&id);
            self.delete_index_entries(txn, collection, &indexes, doc, &id_key)?;
            txn.delete(&primary, &id_key)?;
        }

        schema.doc_count -= matches.len() as i64;
        self.catalog.write_schema(txn, &sys, collection, &schema)?;
        Ok(DeleteResult {
            deleted: matches.len() as u64,
        })
    }

    // ── Indexes ─────────────────────────────────────────────────

    /// Create a secondary index and populate it from the collection.
    /// Returns the index name. Re-creating an identical index succeeds
    /// idempotently; a name collision with different options fails.
    pub fn create_index(
        &self,
        collection: &str,
        keys: Vec<IndexField>,
        name: Option<String>,
        unique: bool,
        sparse: bool,
    ) -> Result<String> {
        self.check_open()?;
        if keys.is_empty() {
            return Err(DbError::Invalid("index key spec is empty".into()));
        }
        for key in &keys {
            if key.field.is_empty() {
                return Err(DbError::Invalid("index field name is empty".into()));
            }
        }
        let name = name.unwrap_or_else(|| IndexSpec::default_name(&keys));
        validate_index_name(&name)?;

        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let (sys, primary, _, _) = self.ensure_collection(&mut txn, collection)?;

        if let Some(existing) = self.catalog.read_index(&txn, &sys, collection, &name)? {
            if existing.keys == keys && existing.unique == unique && existing.sparse == sparse {
                return Ok(name);
            }
            return Err(DbError::Exists(format!(
                "index '{name}' on collection '{collection}'"
            )));
        }

        let spec = IndexSpec {
            name: name.clone(),
            keys,
            unique,
            sparse,
        };
        let tree = txn.create_tree(&encoding::index_tree(collection, &name))?;

        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let iter = txn.scan_prefix(&primary, &[])?;
            iter.collect::<std::result::Result<_, StoreError>>()?
        };
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for (id_key, bytes) in entries {
            let doc: Document = bson::deserialize_from_slice(&bytes)?;
            let composite = encoding::composite_prefix(&spec.keys, &doc);
            if spec.sparse && composite.has_missing_or_null {
                continue;
            }
            if spec.unique && !seen.insert(composite.prefix.clone()) {
                // abort: neither the subtree nor the descriptor survives
                return Err(DbError::UniqueViolation(format!(
                    "building index '{name}' on collection '{collection}'"
                )));
            }
            txn.put(&tree, &encoding::entry_key(&composite.prefix, &id_key), &id_key)?;
        }

        self.catalog.write_index(&mut txn, &sys, collection, &spec)?;
        txn.commit()?;
        self.refresh_collection_cache(collection)?;
        Ok(name)
    }

    /// Drop an index: descriptor and subtree go together.
    pub fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.check_open()?;
        if name == "_id" {
            return Err(DbError::Invalid("the _id index cannot be dropped".into()));
        }
        let _guard = self.lock_writer()?;
        let mut txn = self.store.begin(false)?;
        let sys = txn.create_tree(SYS_TREE)?;
        if self.catalog.read_index(&txn, &sys, collection, name)?.is_none() {
            return Err(DbError::NotFound(format!(
                "index '{name}' on collection '{collection}'"
            )));
        }
        self.catalog.delete_index(&mut txn, &sys, collection, name)?;
        txn.drop_tree(&encoding::index_tree(collection, name))?;
        txn.commit()?;
        self.refresh_collection_cache(collection)
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.check_open()?;
        match self.info(collection) {
            Some(info) => Ok((*info.indexes).clone()),
            None => Err(DbError::NotFound(format!("collection '{collection}'"))),
        }
    }

    // ── Internals ───────────────────────────────────────────────

    /// Resolve a collection inside a write transaction, creating it (tree
    /// plus schema record) on first use.
    fn ensure_collection<T: Transaction>(
        &self,
        txn: &mut T,
        name: &str,
    ) -> Result<(T::Tree, T::Tree, SchemaRecord, Vec<IndexSpec>)> {
        let sys = txn.create_tree(SYS_TREE)?;
        let schema = match self.catalog.read_schema(txn, &sys, name)? {
            Some(schema) => schema,
            None => {
                validate_collection_name(name)?;
                let schema = SchemaRecord::default();
                self.catalog.write_schema(txn, &sys, name, &schema)?;
                schema
            }
        };
        let primary = txn.create_tree(&encoding::collection_tree(name))?;
        let indexes = self.catalog.list_indexes(txn, &sys, name)?;
        Ok((sys, primary, schema, indexes))
    }

    fn collect_matches<T: Transaction>(
        &self,
        txn: &T,
        collection: &str,
        filter: &Filter,
        indexes: &[IndexSpec],
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let plan = planner::plan(filter, indexes);
        let opts = FindOptions {
            limit,
            ..FindOptions::default()
        };
        let cursor = executor::execute(txn, collection, plan, filter.clone(), &opts)?;
        cursor.collect()
    }

    fn insert_index_entries<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        indexes: &[IndexSpec],
        doc: &Document,
        id_key: &[u8],
    ) -> Result<()> {
        for index in indexes {
            let composite = encoding::composite_prefix(&index.keys, doc);
            if index.sparse && composite.has_missing_or_null {
                continue;
            }
            let tree = txn.tree(&encoding::index_tree(collection, &index.name))?;
            if index.unique {
                self.check_unique(txn, &tree, index, collection, &composite.prefix, id_key)?;
            }
            txn.put(
                &tree,
                &encoding::entry_key(&composite.prefix, id_key),
                id_key,
            )?;
        }
        Ok(())
    }

    fn delete_index_entries<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        indexes: &[IndexSpec],
        doc: &Document,
        id_key: &[u8],
    ) -> Result<()> {
        for index in indexes {
            let composite = encoding::composite_prefix(&index.keys, doc);
            if index.sparse && composite.has_missing_or_null {
                continue;
            }
            let tree = txn.tree(&encoding::index_tree(collection, &index.name))?;
            txn.delete(&tree, &encoding::entry_key(&composite.prefix, id_key))?;
        }
        Ok(())
    }

    /// Swap index entries for a document whose indexed fields may have
    /// changed: unique check on the new key first, then remove-old plus
    /// insert-new per affected index.
    fn reindex_document<T: Transaction>(
        &self,
        txn: &mut T,
        collection: &str,
        indexes: &[IndexSpec],
        old: &Document,
        new: &Document,
        id_key: &[u8],
    ) -> Result<()> {
        for index in indexes {
            let old_c = encoding::composite_prefix(&index.keys, old);
            let new_c = encoding::composite_prefix(&index.keys, new);
            let old_live = !(index.sparse && old_c.has_missing_or_null);
            let new_live = !(index.sparse && new_c.has_missing_or_null);
            if old_live && new_live && old_c.prefix == new_c.prefix {
                continue;
            }
            let tree = txn.tree(&encoding::index_tree(collection, &index.name))?;
            if index.unique && new_live {
                self.check_unique(txn, &tree, index, collection, &new_c.prefix, id_key)?;
            }
            if old_live {
                txn.delete(&tree, &encoding::entry_key(&old_c.prefix, id_key))?;
            }
            if new_live {
                txn.put(&tree, &encoding::entry_key(&new_c.prefix, id_key), id_key)?;
            }
        }
        Ok(())
    }

    /// Fail when some other document already owns the composite key.
    fn check_unique<T: Transaction>(
        &self,
        txn: &T,
        tree: &T::Tree,
        index: &IndexSpec,
        collection: &str,
        prefix: &[u8],
        id_key: &[u8],
    ) -> Result<()> {
        let existing = {
            let mut iter = txn.scan_prefix(tree, prefix)?;
            match iter.next() {
                Some(entry) => Some(entry?),
                None => None,
            }
        };
        if let Some((_, owner)) = existing {
            if owner != id_key {
                return Err(DbError::UniqueViolation(format!(
                    "index '{}' on collection '{collection}'",
                    index.name
                )));
            }
        }
        Ok(())
    }
}

/// A read snapshot of the database, for lazy cursors. Dropping it releases
/// the snapshot; nothing needs committing.
pub struct ReadTransaction<'db, S: Store> {
    db: &'db Database<S>,
    txn: S::Txn<'db>,
}

impl<'db, S: Store> ReadTransaction<'db, S> {
    /// Lazily iterate matching documents. The cursor borrows this
    /// transaction and cannot outlive it.
    pub fn find<'a>(
        &'a self,
        collection: &str,
        filter: &Document,
        opts: &FindOptions,
    ) -> Result<Cursor<'a, S::Txn<'db>>> {
        self.db.query(&self.txn, collection, filter, opts)
    }

    pub fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        let opts = FindOptions::new().limit(1);
        let mut cursor = self.find(collection, filter, &opts)?;
        cursor.next().transpose()
    }

    pub fn count(&self, collection: &str, filter: &Document) -> Result<i64> {
        let cursor = self.find(collection, filter, &FindOptions::new())?;
        let mut count = 0i64;
        for doc in cursor {
            doc?;
            count += 1;
        }
        Ok(count)
    }
}

/// An explicit write transaction: every operation of the CRUD surface,
/// batched atomically. Reads inside the transaction observe its own
/// uncommitted writes. Dropping the transaction aborts it.
pub struct WriteTransaction<'db, S: Store> {
    db: &'db Database<S>,
    txn: S::Txn<'db>,
    /// Collections whose cached state must be refreshed at commit.
    touched: HashSet<String>,
    _guard: std::sync::MutexGuard<'db, ()>,
}

impl<'db, S: Store> WriteTransaction<'db, S> {
    pub fn insert_one(&mut self, collection: &str, doc: Document) -> Result<Bson> {
        let id = self.db.insert_in_txn(&mut self.txn, collection, doc)?;
        self.touched.insert(collection.to_string());
        Ok(id)
    }

    pub fn insert_many(&mut self, collection: &str, docs: Vec<Document>) -> Result<Vec<Bson>> {
        if docs.is_empty() {
            return Err(DbError::Invalid("empty insert batch".into()));
        }
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_one(collection, doc)?);
        }
        Ok(ids)
    }

    pub fn update_one(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let result = self
            .db
            .update_in_txn(&mut self.txn, collection, filter, update, upsert, Some(1))?;
        self.touched.insert(collection.to_string());
        Ok(result)
    }

    pub fn update_many(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        let result = self
            .db
            .update_in_txn(&mut self.txn, collection, filter, update, upsert, None)?;
        self.touched.insert(collection.to_string());
        Ok(result)
    }

    pub fn replace_one(
        &mut self,
        collection: &str,
        filter: &Document,
        replacement: &Document,
        upsert: bool,
    ) -> Result<UpdateResult> {
        if replacement.keys().any(|k| k.starts_with('$')) {
            return Err(DbError::BadUpdate(
                "replacement document cannot contain operators".into(),
            ));
        }
        let result = self.db.update_in_txn(
            &mut self.txn,
            collection,
            filter,
            replacement,
            upsert,
            Some(1),
        )?;
        self.touched.insert(collection.to_string());
        Ok(result)
    }

    pub fn delete_one(&mut self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        let result = self
            .db
            .delete_in_txn(&mut self.txn, collection, filter, Some(1))?;
        self.touched.insert(collection.to_string());
        Ok(result)
    }

    pub fn delete_many(&mut self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        let result = self.db.delete_in_txn(&mut self.txn, collection, filter, None)?;
        self.touched.insert(collection.to_string());
        Ok(result)
    }

    /// Query inside the transaction, observing its uncommitted writes.
    pub fn find<'a>(
        &'a self,
        collection: &str,
        filter: &Document,
        opts: &FindOptions,
    ) -> Result<Cursor<'a, S::Txn<'db>>> {
        self.db.query_in_txn(&self.txn, collection, filter, opts)
    }

    pub fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        let opts = FindOptions::new().limit(1);
        let mut cursor = self.find(collection, filter, &opts)?;
        cursor.next().transpose()
    }

    /// Commit everything written through this transaction, then refresh the
    /// handle's cached collection state.
    pub fn commit(self) -> Result<()> {
        let WriteTransaction {
            db,
            txn,
            touched,
            _guard: guard,
        } = self;
        txn.commit()?;
        for collection in &touched {
            db.refresh_collection_cache(collection)?;
        }
        drop(guard);
        Ok(())
    }

    /// Discard everything written through this transaction.
    pub fn rollback(self) -> Result<()> {
        self.txn.rollback()?;
        Ok(())
    }
}

// ── Free helpers ────────────────────────────────────────────────

fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DbError::Invalid("collection name is empty".into()));
    }
    if name.contains(':') {
        return Err(DbError::Invalid(
            "collection name cannot contain ':'".into(),
        ));
    }
    Ok(())
}

fn validate_index_name(name: &str) -> Result<()> {
    if name == "_id" {
        return Err(DbError::Invalid("'_id' is reserved for the primary index".into()));
    }
    if name.is_empty() {
        return Err(DbError::Invalid("index name is empty".into()));
    }
    if name.contains(':') {
        return Err(DbError::Invalid("index name cannot contain ':'".into()));
    }
    Ok(())
}

/// Validate or generate the `_id`. A caller-supplied `_id` keeps the
/// document bytes untouched; a generated one goes in front.
fn normalize_id(doc: Document) -> Result<(Document, Bson, bool)> {
    match doc.get("_id") {
        Some(Bson::Array(_) | Bson::Undefined | Bson::MinKey | Bson::MaxKey) => Err(
            DbError::Invalid("unsupported _id type".into()),
        ),
        Some(id) => {
            let id = id.clone();
            Ok((doc, id, false))
        }
        None => {
            let oid = ObjectId::new();
            let mut out = Document::new();
            out.insert("_id", oid);
            for (key, value) in doc {
                out.insert(key, value);
            }
            Ok((out, Bson::ObjectId(oid), true))
        }
    }
}

/// Base document for an upsert: the filter's top-level simple-equality
/// fields. Logical operators make the synthesis ambiguous and are rejected.
fn synthesize_upsert(filter_doc: &Document, update: &UpdateDoc) -> Result<Document> {
    let mut base = Document::new();
    for (key, value) in filter_doc.iter() {
        if key.starts_with('$') {
            return Err(DbError::BadUpdate(
                "upsert is not supported with logical filter operators".into(),
            ));
        }
        match value {
            Bson::Document(d) if filter::is_operator_doc(d) => {}
            other => {
                base.insert(key.clone(), other.clone());
            }
        }
    }

    match update {
        UpdateDoc::Replacement(body) => {
            let mut doc = Document::new();
            if let Some(id) = base.get("_id") {
                if !body.contains_key("_id") {
                    doc.insert("_id", id.clone());
                }
            }
            for (key, value) in body.iter() {
                doc.insert(key.clone(), value.clone());
            }
            Ok(doc)
        }
        UpdateDoc::Operators(update) => update.apply(&base),
    }
}

/// Replacement body for an existing document: `_id` (if present) must equal
/// the target's, and the stored form always carries the original `_id`
/// first.
fn build_replacement(id: &Bson, body: &Document) -> Result<Document> {
    if let Some(replacement_id) = body.get("_id") {
        if !order::values_equal(replacement_id, id) {
            return Err(DbError::ImmutableId);
        }
    }
    let mut doc = Document::new();
    doc.insert("_id", id.clone());
    for (key, value) in body.iter() {
        if key != "_id" {
            doc.insert(key.clone(), value.clone());
        }
    }
    Ok(doc)
}

//! Plan execution.
//!
//! Runs a [`Plan`] inside a transaction and yields documents through a
//! [`Cursor`]: residual filter first, then (when sorting) materialize and
//! sort, then skip/limit, then projection. Every candidate is rechecked by
//! the matcher regardless of the access path.

use std::collections::HashSet;

use bson::{Bson, Document};

use quill_store::{KvIter, StoreError, Transaction};

use crate::catalog::Direction;
use crate::encoding;
use crate::error::{DbError, Result};
use crate::filter::Filter;
use crate::matcher;
use crate::order;
use crate::planner::Plan;

/// One sort key.
#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
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

/// Options for `find`-family operations.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Fields to keep (`_id` is always kept). `None` or an empty list keeps
    /// every field.
    pub projection: Option<Vec<String>>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Vec<Sort>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn skip(mut self, n: usize) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn sort(mut self, sorts: impl IntoIterator<Item = Sort>) -> Self {
        self.sort = sorts.into_iter().collect();
        self
    }
}

/// Lazily yields matching documents. Borrows the transaction it reads from,
/// so it cannot outlive the database handle.
pub struct Cursor<'a, T: Transaction> {
    inner: Inner<'a, T>,
}

enum Inner<'a, T: Transaction> {
    Streaming {
        source: Source<'a, T>,
        filter: Filter,
        projection: Option<Vec<String>>,
        skip: usize,
        remaining: Option<usize>,
    },
    /// Sorted results are materialized up front and streamed from memory.
    Sorted(std::vec::IntoIter<Document>),
}

enum Source<'a, T: Transaction> {
    Empty,
    /// Primary-key fetch: at most one pre-decoded document.
    Single(std::option::IntoIter<Document>),
    /// Primary-tree walk: values are document bytes.
    Primary(KvIter<'a>),
    /// Index seek: candidate primary keys (already in primary-tree order),
    /// documents fetched lazily per key.
    IdList {
        ids: std::vec::IntoIter<Vec<u8>>,
        txn: &'a T,
        primary: T::Tree,
    },
}

impl<'a, T: Transaction> Source<'a, T> {
    fn next_doc(&mut self) -> Option<Result<Document>> {
        match self {
            Source::Empty => None,
            Source::Single(it) => it.next().map(Ok),
            Source::Primary(iter) => {
                let entry = iter.next()?;
                Some(entry.map_err(DbError::from).and_then(|(_, bytes)| {
                    bson::deserialize_from_slice(&bytes).map_err(DbError::from)
                }))
            }
            Source::IdList { ids, txn, primary } => loop {
                let id_key = ids.next()?;
                match txn.get(primary, &id_key) {
                    Ok(Some(bytes)) => {
                        return Some(bson::deserialize_from_slice(&bytes).map_err(DbError::from));
                    }
                    // entry without a primary row — skip rather than fail
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e.into())),
                }
            },
        }
    }
}

impl<'a, T: Transaction> Cursor<'a, T> {
    pub(crate) fn empty() -> Self {
        Self {
            inner: Inner::Streaming {
                source: Source::Empty,
                filter: Filter::All,
                projection: None,
                skip: 0,
                remaining: None,
            },
        }
    }

    /// Drop the cursor, releasing its borrow of the transaction.
    pub fn close(self) {}
}

impl<'a, T: Transaction> Iterator for Cursor<'a, T> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Sorted(iter) => iter.next().map(Ok),
            Inner::Streaming {
                source,
                filter,
                projection,
                skip,
                remaining,
            } => loop {
                if matches!(remaining, Some(0)) {
                    return None;
                }
                let doc = match source.next_doc()? {
                    Ok(doc) => doc,
                    Err(e) => return Some(Err(e)),
                };
                if !matcher::matches(&doc, filter) {
                    continue;
                }
                if *skip > 0 {
                    *skip -= 1;
                    continue;
                }
                if let Some(rem) = remaining {
                    *rem -= 1;
                }
                let mut doc = doc;
                apply_projection(&mut doc, projection.as_deref());
                return Some(Ok(doc));
            },
        }
    }
}

/// Execute a plan, returning a cursor over the matching documents.
pub(crate) fn execute<'a, T: Transaction>(
    txn: &'a T,
    collection: &str,
    plan: Plan,
    filter: Filter,
    opts: &FindOptions,
) -> Result<Cursor<'a, T>> {
    let primary = match txn.tree(&encoding::collection_tree(collection)) {
        Ok(tree) => tree,
        Err(StoreError::TreeNotFound(_)) => return Ok(Cursor::empty()),
        Err(e) => return Err(e.into()),
    };

    let source = match plan {
        Plan::PrimaryKeyFetch(id) => {
            let key = encoding::primary_key(&id);
            let doc = match txn.get(&primary, &key)? {
                Some(bytes) => Some(bson::deserialize_from_slice(&bytes)?),
                None => None,
            };
            Source::Single(doc.into_iter())
        }
        Plan::IndexSeek { index, values } => {
            // A missing index subtree falls back to a full scan; the
            // residual filter keeps the result set identical.
            match txn.tree(&encoding::index_tree(collection, &index.name)) {
                Ok(tree) => {
                    let prefix = encoding::seek_prefix(&index.keys, &values);
                    // Drain the matching entries and order the candidates by
                    // primary key, so results come back in primary-tree
                    // order no matter which access path ran.
                    let mut ids = Vec::new();
                    for entry in txn.scan_prefix(&tree, &prefix)? {
                        let (_, id_key) = entry?;
                        ids.push(id_key);
                    }
                    ids.sort();
                    Source::IdList {
                        ids: ids.into_iter(),
                        txn,
                        primary: primary.clone(),
                    }
                }
                Err(StoreError::TreeNotFound(_)) => {
                    Source::Primary(txn.scan_prefix(&primary, &[])?)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Plan::CollectionScan => Source::Primary(txn.scan_prefix(&primary, &[])?),
    };

    if opts.sort.is_empty() {
        return Ok(Cursor {
            inner: Inner::Streaming {
                source,
                filter,
                projection: opts.projection.clone(),
                skip: opts.skip.unwrap_or(0),
                remaining: opts.limit,
            },
        });
    }

    // Sorted path: materialize the filtered set, order it, then slice.
    let mut source = source;
    let mut docs = Vec::new();
    while let Some(entry) = source.next_doc() {
        let doc = entry?;
        if matcher::matches(&doc, &filter) {
            docs.push(doc);
        }
    }
    sort_documents(&mut docs, &opts.sort);

    let iter = docs.into_iter().skip(opts.skip.unwrap_or(0));
    let mut selected: Vec<Document> = match opts.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    };
    for doc in &mut selected {
        apply_projection(doc, opts.projection.as_deref());
    }
    Ok(Cursor {
        inner: Inner::Sorted(selected.into_iter()),
    })
}

/// Order documents by the sort spec using the cross-type comparator.
/// Missing fields sort as null.
pub(crate) fn sort_documents(docs: &mut [Document], sorts: &[Sort]) {
    docs.sort_by(|a, b| {
        for sort in sorts {
            let av = matcher::get_path(a, &sort.field).unwrap_or(&Bson::Null);
            let bv = matcher::get_path(b, &sort.field).unwrap_or(&Bson::Null);
            let ord = order::compare(av, bv);
            let ord = match sort.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Keep only the projected top-level fields. `_id` always survives; an
/// empty projection keeps everything.
pub(crate) fn apply_projection(doc: &mut Document, projection: Option<&[String]>) {
    let Some(columns) = projection else { return };
    if columns.is_empty() {
        return;
    }
    let keep: HashSet<&str> = columns
        .iter()
        .map(|c| c.split('.').next().unwrap_or(c.as_str()))
        .collect();
    let fields: Vec<String> = doc.keys().cloned().collect();
    for field in fields {
        if field != "_id" && !keep.contains(field.as_str()) {
            doc.remove(&field);
        }
    }
}

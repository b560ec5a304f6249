//! Access-path selection.
//!
//! Three access paths: direct primary-key fetch, secondary-index seek on an
//! equality prefix, full collection scan. The compiled filter is always kept
//! as the residual check, so a plan can over-approximate but never changes
//! query results. Planning itself cannot fail — anything irregular falls
//! back to a scan.

use bson::Bson;

use crate::catalog::IndexSpec;
use crate::filter::{Filter, Pred};

#[derive(Debug, Clone)]
pub(crate) enum Plan {
    /// The filter is exactly `{_id: <scalar>}` — direct get on the primary
    /// tree.
    PrimaryKeyFetch(Bson),
    /// Seek an index at the equality prefix and walk entries sharing it.
    IndexSeek {
        index: IndexSpec,
        values: Vec<Bson>,
    },
    /// Walk the whole primary tree.
    CollectionScan,
}

pub(crate) fn plan(filter: &Filter, indexes: &[IndexSpec]) -> Plan {
    if let Filter::Field { path, preds } = filter {
        if path == "_id" {
            if let [Pred::Eq(v)] = &preds[..] {
                if is_seekable_scalar(v) {
                    return Plan::PrimaryKeyFetch(v.clone());
                }
            }
        }
    }

    let eq = eq_fields(filter);
    if eq.is_empty() {
        return Plan::CollectionScan;
    }

    let mut best: Option<(usize, &IndexSpec)> = None;
    for index in indexes {
        let mut len = 0;
        for key in &index.keys {
            if eq.iter().any(|(field, _)| *field == key.field) {
                len += 1;
            } else {
                break;
            }
        }
        if len == 0 {
            continue;
        }
        // A sparse index omits documents missing any indexed field, so it is
        // only a safe access path when the equality prefix pins down every
        // key field.
        if index.sparse && len < index.keys.len() {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_len, best_index)) => {
                len > best_len
                    || (len == best_len
                        && (index.keys.len() < best_index.keys.len()
                            || (index.keys.len() == best_index.keys.len()
                                && index.name < best_index.name)))
            }
        };
        if better {
            best = Some((len, index));
        }
    }

    match best {
        Some((len, index)) => {
            let values = index.keys[..len]
                .iter()
                .map(|key| {
                    eq.iter()
                        .find(|(field, _)| *field == key.field)
                        .map(|(_, v)| (*v).clone())
                        .expect("prefix fields are covered")
                })
                .collect();
            Plan::IndexSeek {
                index: index.clone(),
                values,
            }
        }
        None => Plan::CollectionScan,
    }
}

/// Top-level fields constrained by simple scalar equality. Nested logical
/// operators and operator predicates do not contribute.
fn eq_fields(filter: &Filter) -> Vec<(&str, &Bson)> {
    let mut out = Vec::new();
    match filter {
        Filter::Field { .. } => push_eq(filter, &mut out),
        Filter::And(children) => {
            for child in children {
                push_eq(child, &mut out);
            }
        }
        _ => {}
    }
    out
}

fn push_eq<'f>(filter: &'f Filter, out: &mut Vec<(&'f str, &'f Bson)>) {
    if let Filter::Field { path, preds } = filter {
        if let [Pred::Eq(v)] = &preds[..] {
            if is_seekable_scalar(v) && !out.iter().any(|(field, _)| *field == path.as_str()) {
                out.push((path.as_str(), v));
            }
        }
    }
}

/// Values usable as index seek keys. Null is excluded because a null
/// equality also matches documents where the path is absent, which sparse
/// indexes do not carry and which scans handle uniformly.
fn is_seekable_scalar(value: &Bson) -> bool {
    !matches!(
        value,
        Bson::Null
            | Bson::Undefined
            | Bson::Array(_)
            | Bson::Document(_)
            | Bson::RegularExpression(_)
            | Bson::MinKey
            | Bson::MaxKey
    )
}

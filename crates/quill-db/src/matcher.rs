//! Filter evaluation.
//!
//! Evaluates a compiled [`Filter`] against a candidate document. Dotted
//! paths traverse sub-documents; when a path element is an array, predicates
//! match if any element matches (`$size` and `$all` apply to the array as a
//! whole). Range operators use the total cross-type order, so mismatched
//! precedence classes fall back to precedence ordering.

use bson::{Bson, Document};

use crate::filter::{Filter, Pred};
use crate::order;

pub fn matches(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::And(children) => children.iter().all(|c| matches(doc, c)),
        Filter::Or(children) => children.iter().any(|c| matches(doc, c)),
        Filter::Nor(children) => !children.iter().any(|c| matches(doc, c)),
        Filter::Field { path, preds } => {
            let values = resolve_values(doc, path);
            preds.iter().all(|p| pred_matches(&values, p))
        }
    }
}

/// Plain dotted-path lookup without element-of expansion. Array segments are
/// traversed by numeric index only. Used for index key extraction, sorting,
/// and upsert synthesis, where a single value is wanted.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    match path.split_once('.') {
        None => doc.get(path),
        Some((head, rest)) => {
            let mut value = doc.get(head)?;
            for seg in rest.split('.') {
                value = match value {
                    Bson::Document(d) => d.get(seg)?,
                    Bson::Array(arr) => arr.get(seg.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            Some(value)
        }
    }
}

/// Resolve a dotted path to the set of candidate values, expanding arrays
/// encountered mid-path (element-of semantics). An empty result means the
/// path is absent.
fn resolve_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next().expect("split yields at least one segment");

    let mut current: Vec<&Bson> = match doc.get(first) {
        Some(v) => vec![v],
        None => Vec::new(),
    };

    for seg in segments {
        let mut next = Vec::new();
        for value in current {
            step_into(value, seg, &mut next);
        }
        current = next;
    }
    current
}

fn step_into<'a>(value: &'a Bson, seg: &str, out: &mut Vec<&'a Bson>) {
    match value {
        Bson::Document(d) => {
            if let Some(v) = d.get(seg) {
                out.push(v);
            }
        }
        Bson::Array(arr) => {
            if let Ok(idx) = seg.parse::<usize>() {
                if let Some(v) = arr.get(idx) {
                    out.push(v);
                }
            }
            for elem in arr {
                if let Bson::Document(d) = elem {
                    if let Some(v) = d.get(seg) {
                        out.push(v);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Evaluate a predicate set against a single value (used by `$pull` with a
/// condition document).
pub(crate) fn element_matches(value: &Bson, preds: &[Pred]) -> bool {
    preds.iter().all(|p| pred_matches(&[value], p))
}

fn pred_matches(values: &[&Bson], pred: &Pred) -> bool {
    match pred {
        Pred::Eq(target) => eq_match(values, target),
        Pred::Ne(target) => !eq_match(values, target),
        Pred::Gt(target) => cmp_match(values, target, |ord| ord.is_gt()),
        Pred::Gte(target) => cmp_match(values, target, |ord| ord.is_ge()),
        Pred::Lt(target) => cmp_match(values, target, |ord| ord.is_lt()),
        Pred::Lte(target) => cmp_match(values, target, |ord| ord.is_le()),
        Pred::In(targets) => targets.iter().any(|t| eq_match(values, t)),
        Pred::Nin(targets) => !targets.iter().any(|t| eq_match(values, t)),
        Pred::Exists(wanted) => !values.is_empty() == *wanted,
        Pred::Type(types) => values.iter().any(|v| {
            types.contains(&v.element_type())
                || matches!(v, Bson::Array(arr)
                    if arr.iter().any(|e| types.contains(&e.element_type())))
        }),
        Pred::All(required) => {
            !required.is_empty()
                && values.iter().any(|v| match v {
                    Bson::Array(arr) => required
                        .iter()
                        .all(|r| arr.iter().any(|e| order::values_equal(e, r))),
                    _ => false,
                })
        }
        Pred::Size(n) => values
            .iter()
            .any(|v| matches!(v, Bson::Array(arr) if arr.len() as i64 == *n)),
        Pred::Regex(re) => values.iter().any(|v| match v {
            Bson::String(s) => re.is_match(s),
            Bson::Array(arr) => arr
                .iter()
                .any(|e| matches!(e, Bson::String(s) if re.is_match(s))),
            _ => false,
        }),
        Pred::ElemMatchFilter(filter) => values.iter().any(|v| match v {
            Bson::Array(arr) => arr
                .iter()
                .any(|e| matches!(e, Bson::Document(d) if matches(d, filter))),
            _ => false,
        }),
        Pred::ElemMatchPreds(preds) => values.iter().any(|v| match v {
            Bson::Array(arr) => arr
                .iter()
                .any(|e| preds.iter().all(|p| pred_matches(&[e], p))),
            _ => false,
        }),
        Pred::Not(preds) => !preds.iter().all(|p| pred_matches(values, p)),
    }
}

/// Equality with element-of semantics. A null target also matches an absent
/// path.
fn eq_match(values: &[&Bson], target: &Bson) -> bool {
    if values.is_empty() {
        return matches!(target, Bson::Null);
    }
    values.iter().any(|v| {
        order::values_equal(v, target)
            || matches!(v, Bson::Array(arr)
                if arr.iter().any(|e| order::values_equal(e, target)))
    })
}

fn cmp_match(values: &[&Bson], target: &Bson, pred: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    values.iter().any(|v| {
        pred(order::compare(v, target))
            || matches!(v, Bson::Array(arr)
                if arr.iter().any(|e| pred(order::compare(e, target))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{RegexCache, compile};
    use bson::doc;

    fn check(doc: &Document, filter: Document) -> bool {
        let compiled = compile(&filter, &RegexCache::default()).unwrap();
        matches(doc, &compiled)
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(check(&doc! { "a": 1 }, doc! {}));
        assert!(check(&doc! {}, doc! {}));
    }

    #[test]
    fn implicit_and_explicit_eq() {
        let d = doc! { "name": "Alice", "age": 30 };
        assert!(check(&d, doc! { "name": "Alice" }));
        assert!(check(&d, doc! { "age": { "$eq": 30 } }));
        assert!(check(&d, doc! { "age": 30.0 }));
        assert!(!check(&d, doc! { "name": "Bob" }));
    }

    #[test]
    fn range_operators() {
        let d = doc! { "age": 30 };
        assert!(check(&d, doc! { "age": { "$gt": 18 } }));
        assert!(check(&d, doc! { "age": { "$gte": 30 } }));
        assert!(check(&d, doc! { "age": { "$lt": 31 } }));
        assert!(!check(&d, doc! { "age": { "$lte": 29 } }));
        assert!(check(&d, doc! { "age": { "$gte": 18, "$lt": 65 } }));
    }

    #[test]
    fn cross_type_range_falls_back_to_precedence() {
        // string outranks every number
        let d = doc! { "v": "text" };
        assert!(check(&d, doc! { "v": { "$gt": 100 } }));
        assert!(!check(&d, doc! { "v": { "$lt": 100 } }));
    }

    #[test]
    fn ne_and_missing_fields() {
        let d = doc! { "a": 1 };
        assert!(check(&d, doc! { "b": { "$ne": 5 } }));
        assert!(check(&d, doc! { "a": { "$ne": 2 } }));
        assert!(!check(&d, doc! { "a": { "$ne": 1 } }));
    }

    #[test]
    fn in_and_nin() {
        let d = doc! { "city": "NYC" };
        assert!(check(&d, doc! { "city": { "$in": ["NYC", "LA"] } }));
        assert!(!check(&d, doc! { "city": { "$in": ["SF", "LA"] } }));
        assert!(check(&d, doc! { "city": { "$nin": ["SF", "LA"] } }));
        // missing field: $in never matches, $nin always does
        assert!(!check(&d, doc! { "state": { "$in": ["TX"] } }));
        assert!(check(&d, doc! { "state": { "$nin": ["TX"] } }));
    }

    #[test]
    fn exists_matches_null_but_not_absent() {
        let d = doc! { "a": Bson::Null };
        assert!(check(&d, doc! { "a": { "$exists": true } }));
        assert!(!check(&d, doc! { "a": { "$exists": false } }));
        assert!(!check(&d, doc! { "b": { "$exists": true } }));
        assert!(check(&d, doc! { "b": { "$exists": false } }));
    }

    #[test]
    fn null_eq_matches_absent_and_null() {
        assert!(check(&doc! { "a": Bson::Null }, doc! { "a": Bson::Null }));
        assert!(check(&doc! { "b": 1 }, doc! { "a": Bson::Null }));
        assert!(!check(&doc! { "a": 1 }, doc! { "a": Bson::Null }));
    }

    #[test]
    fn dotted_paths() {
        let d = doc! { "address": { "city": "Austin", "zip": 78701 } };
        assert!(check(&d, doc! { "address.city": "Austin" }));
        assert!(check(&d, doc! { "address.zip": { "$gt": 70000 } }));
        assert!(!check(&d, doc! { "address.state": { "$exists": true } }));
    }

    #[test]
    fn array_element_of_semantics() {
        let d = doc! { "tags": ["rust", "db"] };
        assert!(check(&d, doc! { "tags": "rust" }));
        assert!(!check(&d, doc! { "tags": "go" }));
        assert!(check(&d, doc! { "tags": { "$in": ["go", "db"] } }));
    }

    #[test]
    fn path_through_array_of_documents() {
        let d = doc! { "items": [ { "sku": "a", "qty": 2 }, { "sku": "b", "qty": 9 } ] };
        assert!(check(&d, doc! { "items.sku": "b" }));
        assert!(check(&d, doc! { "items.qty": { "$gt": 5 } }));
        assert!(check(&d, doc! { "items.0.sku": "a" }));
        assert!(!check(&d, doc! { "items.sku": "c" }));
    }

    #[test]
    fn size_applies_to_whole_array() {
        let d = doc! { "tags": ["a", "b"] };
        assert!(check(&d, doc! { "tags": { "$size": 2 } }));
        assert!(!check(&d, doc! { "tags": { "$size": 1 } }));
        assert!(check(&doc! { "tags": [] }, doc! { "tags": { "$size": 0 } }));
        assert!(!check(&doc! { "tags": "x" }, doc! { "tags": { "$size": 0 } }));
    }

    #[test]
    fn all_requires_every_element() {
        let d = doc! { "tags": ["a", "b", "c"] };
        assert!(check(&d, doc! { "tags": { "$all": ["a", "c"] } }));
        assert!(!check(&d, doc! { "tags": { "$all": ["a", "z"] } }));
        assert!(!check(&d, doc! { "tags": { "$all": [] } }));
    }

    #[test]
    fn type_operator() {
        let d = doc! { "n": 1_i64, "s": "x" };
        assert!(check(&d, doc! { "n": { "$type": "long" } }));
        assert!(check(&d, doc! { "n": { "$type": 18 } }));
        assert!(check(&d, doc! { "n": { "$type": "number" } }));
        assert!(!check(&d, doc! { "n": { "$type": "string" } }));
        assert!(check(&d, doc! { "s": { "$type": 2 } }));
    }

    #[test]
    fn regex_matching() {
        let d = doc! { "email": "alice@example.com" };
        assert!(check(&d, doc! { "email": { "$regex": "^alice@" } }));
        assert!(check(&d, doc! { "email": { "$regex": "^ALICE@", "$options": "i" } }));
        assert!(!check(&d, doc! { "email": { "$regex": "^bob@" } }));
        // non-string targets never match
        assert!(!check(&doc! { "email": 42 }, doc! { "email": { "$regex": "4" } }));
    }

    #[test]
    fn logical_operators() {
        let d = doc! { "age": 30, "city": "NYC" };
        assert!(check(
            &d,
            doc! { "$and": [ { "age": { "$gte": 18 } }, { "city": "NYC" } ] }
        ));
        assert!(check(
            &d,
            doc! { "$or": [ { "city": "LA" }, { "age": { "$lt": 40 } } ] }
        ));
        assert!(check(
            &d,
            doc! { "$nor": [ { "city": "LA" }, { "age": { "$gt": 40 } } ] }
        ));
        assert!(!check(&d, doc! { "$nor": [ { "city": "NYC" } ] }));
    }

    #[test]
    fn not_inverts_predicates() {
        let d = doc! { "age": 30 };
        assert!(check(&d, doc! { "age": { "$not": { "$gt": 40 } } }));
        assert!(!check(&d, doc! { "age": { "$not": { "$gt": 20 } } }));
        // $not on a missing field matches
        assert!(check(&d, doc! { "name": { "$not": { "$eq": "x" } } }));
    }

    #[test]
    fn elem_match() {
        let d = doc! { "results": [ { "product": "a", "score": 8 }, { "product": "b", "score": 5 } ] };
        assert!(check(
            &d,
            doc! { "results": { "$elemMatch": { "product": "a", "score": { "$gte": 8 } } } }
        ));
        assert!(!check(
            &d,
            doc! { "results": { "$elemMatch": { "product": "b", "score": { "$gte": 8 } } } }
        ));

        let d = doc! { "scores": [82, 85, 88] };
        assert!(check(
            &d,
            doc! { "scores": { "$elemMatch": { "$gt": 84, "$lt": 86 } } }
        ));
        assert!(!check(
            &d,
            doc! { "scores": { "$elemMatch": { "$gt": 90 } } }
        ));
    }

    #[test]
    fn get_path_walks_documents_and_indexes() {
        let d = doc! { "a": { "b": { "c": 42 } }, "arr": [ { "x": 1 } ] };
        assert_eq!(get_path(&d, "a.b.c"), Some(&Bson::Int32(42)));
        assert_eq!(get_path(&d, "arr.0.x"), Some(&Bson::Int32(1)));
        assert_eq!(get_path(&d, "a.b.missing"), None);
        assert_eq!(get_path(&d, "arr.x"), None);
    }
}

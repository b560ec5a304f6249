//! Update documents: parsing and application.
//!
//! An update document is either a *replacement* (no top-level `$`-operators)
//! or an *operator update*. Operators apply in a fixed canonical order —
//! `$unset, $set, $inc, $mul, $min, $max, $rename`, then the array
//! operators — regardless of their order in the update document. Operators
//! never touch `_id`.

use bson::{Bson, Document};

use crate::error::{DbError, Result};
use crate::filter::{Pred, RegexCache, is_operator_doc, parse_operator_doc};
use crate::matcher;
use crate::order;

#[derive(Debug, Clone)]
pub(crate) enum UpdateDoc {
    /// Full replacement of the document body.
    Replacement(Document),
    /// Operator-by-operator mutation.
    Operators(Update),
}

#[derive(Debug, Clone)]
pub(crate) enum UpdateOp {
    Set(Bson),
    Unset,
    Inc(Bson),
    Mul(Bson),
    Min(Bson),
    Max(Bson),
    Rename(String),
    Push(Bson),
    Pull(Bson),
    PullMatching(Vec<Pred>),
    AddToSet(Bson),
    Pop(i32),
}

impl UpdateOp {
    /// Canonical application phase. Within a phase, document order is kept.
    fn phase(&self) -> u8 {
        match self {
            UpdateOp::Unset => 0,
            UpdateOp::Set(_) => 1,
            UpdateOp::Inc(_) => 2,
            UpdateOp::Mul(_) => 3,
            UpdateOp::Min(_) => 4,
            UpdateOp::Max(_) => 5,
            UpdateOp::Rename(_) => 6,
            UpdateOp::Push(_) => 7,
            UpdateOp::Pull(_) | UpdateOp::PullMatching(_) => 8,
            UpdateOp::AddToSet(_) => 9,
            UpdateOp::Pop(_) => 10,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FieldUpdate {
    pub field: String,
    pub op: UpdateOp,
}

#[derive(Debug, Clone)]
pub(crate) struct Update {
    ops: Vec<FieldUpdate>,
}

/// Parse an update document.
///
/// # Errors
///
/// `BadUpdate` for unknown operators, mixed replacement/operator shapes, and
/// invalid operand shapes; `ImmutableId` when an operator targets `_id`.
pub(crate) fn parse_update(doc: &Document, cache: &RegexCache) -> Result<UpdateDoc> {
    let has_operators = doc.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        return Ok(UpdateDoc::Replacement(doc.clone()));
    }
    if doc.keys().any(|k| !k.starts_with('$')) {
        return Err(DbError::BadUpdate(
            "cannot mix operators and replacement fields".into(),
        ));
    }

    let mut ops = Vec::new();
    for (key, value) in doc.iter() {
        match key.as_str() {
            "$set" => parse_value_fields(key, value, UpdateOp::Set, &mut ops)?,
            "$unset" => parse_fields(key, value, &mut ops, |_| Ok(UpdateOp::Unset))?,
            "$inc" => parse_numeric_fields(key, value, UpdateOp::Inc, &mut ops)?,
            "$mul" => parse_numeric_fields(key, value, UpdateOp::Mul, &mut ops)?,
            "$min" => parse_value_fields(key, value, UpdateOp::Min, &mut ops)?,
            "$max" => parse_value_fields(key, value, UpdateOp::Max, &mut ops)?,
            "$rename" => parse_fields(key, value, &mut ops, |v| match v {
                Bson::String(new_name) => {
                    check_target(new_name)?;
                    Ok(UpdateOp::Rename(new_name.clone()))
                }
                _ => Err(DbError::BadUpdate("$rename value must be a string".into())),
            })?,
            "$push" => parse_value_fields(key, value, UpdateOp::Push, &mut ops)?,
            "$pull" => parse_fields(key, value, &mut ops, |v| match v {
                Bson::Document(cond) if is_operator_doc(cond) => {
                    let preds = parse_operator_doc(cond, cache)
                        .map_err(|e| DbError::BadUpdate(format!("$pull condition: {e}")))?;
                    Ok(UpdateOp::PullMatching(preds))
                }
                other => Ok(UpdateOp::Pull(other.clone())),
            })?,
            "$addToSet" => parse_value_fields(key, value, UpdateOp::AddToSet, &mut ops)?,
            "$pop" => parse_fields(key, value, &mut ops, |v| match v {
                Bson::Int32(1) | Bson::Int64(1) => Ok(UpdateOp::Pop(1)),
                Bson::Int32(-1) | Bson::Int64(-1) => Ok(UpdateOp::Pop(-1)),
                _ => Err(DbError::BadUpdate("$pop value must be 1 or -1".into())),
            })?,
            other => {
                return Err(DbError::BadUpdate(format!("unknown operator: {other}")));
            }
        }
    }

    if ops.is_empty() {
        return Err(DbError::BadUpdate("empty update document".into()));
    }
    Ok(UpdateDoc::Operators(Update { ops }))
}

fn parse_fields(
    op_name: &str,
    value: &Bson,
    ops: &mut Vec<FieldUpdate>,
    make: impl Fn(&Bson) -> Result<UpdateOp>,
) -> Result<()> {
    let sub = match value {
        Bson::Document(d) => d,
        _ => {
            return Err(DbError::BadUpdate(format!(
                "{op_name} value must be a document"
            )));
        }
    };
    if sub.is_empty() {
        return Err(DbError::BadUpdate(format!("{op_name} document is empty")));
    }
    for (field, operand) in sub.iter() {
        check_target(field)?;
        ops.push(FieldUpdate {
            field: field.clone(),
            op: make(operand)?,
        });
    }
    Ok(())
}

fn parse_value_fields(
    op_name: &str,
    value: &Bson,
    make: fn(Bson) -> UpdateOp,
    ops: &mut Vec<FieldUpdate>,
) -> Result<()> {
    parse_fields(op_name, value, ops, |v| Ok(make(v.clone())))
}

fn parse_numeric_fields(
    op_name: &str,
    value: &Bson,
    make: fn(Bson) -> UpdateOp,
    ops: &mut Vec<FieldUpdate>,
) -> Result<()> {
    parse_fields(op_name, value, ops, |v| match v {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(make(v.clone())),
        _ => Err(DbError::BadUpdate(format!(
            "{op_name} operand must be numeric"
        ))),
    })
}

/// Operator targets may be dotted paths but can never reach `_id`.
fn check_target(path: &str) -> Result<()> {
    if path.is_empty() || path.split('.').any(|seg| seg.is_empty()) {
        return Err(DbError::BadUpdate(format!("invalid field path: '{path}'")));
    }
    if path == "_id" || path.starts_with("_id.") {
        return Err(DbError::ImmutableId);
    }
    Ok(())
}

impl Update {
    /// Apply the update to a document, producing the new version. The input
    /// document's `_id` is never touched.
    pub(crate) fn apply(&self, doc: &Document) -> Result<Document> {
        let mut out = doc.clone();
        let mut order: Vec<&FieldUpdate> = self.ops.iter().collect();
        order.sort_by_key(|fm| fm.op.phase());
        for fm in order {
            apply_one(&mut out, fm)?;
        }
        Ok(out)
    }
}

fn apply_one(doc: &mut Document, fm: &FieldUpdate) -> Result<()> {
    match &fm.op {
        UpdateOp::Set(value) => {
            if let Some((parent, leaf)) = resolve_parent_mut(doc, &fm.field, true)? {
                parent.insert(leaf.to_string(), value.clone());
            }
            Ok(())
        }
        UpdateOp::Unset => {
            if let Some((parent, leaf)) = resolve_parent_mut(doc, &fm.field, false)? {
                parent.remove(leaf);
            }
            Ok(())
        }
        UpdateOp::Inc(amount) => apply_arith(doc, &fm.field, amount, ArithOp::Add),
        UpdateOp::Mul(amount) => apply_arith(doc, &fm.field, amount, ArithOp::Mul),
        UpdateOp::Min(value) => apply_bound(doc, &fm.field, value, std::cmp::Ordering::Less),
        UpdateOp::Max(value) => apply_bound(doc, &fm.field, value, std::cmp::Ordering::Greater),
        UpdateOp::Rename(new_path) => {
            let taken = match resolve_parent_mut(doc, &fm.field, false)? {
                Some((parent, leaf)) => parent.remove(leaf),
                None => None,
            };
            if let Some(value) = taken {
                if let Some((parent, leaf)) = resolve_parent_mut(doc, new_path, true)? {
                    parent.insert(leaf.to_string(), value);
                }
            }
            Ok(())
        }
        UpdateOp::Push(value) => with_array(doc, &fm.field, true, |arr| {
            arr.push(value.clone());
            Ok(())
        }),
        UpdateOp::Pull(value) => with_array(doc, &fm.field, false, |arr| {
            arr.retain(|e| !order::values_equal(e, value));
            Ok(())
        }),
        UpdateOp::PullMatching(preds) => with_array(doc, &fm.field, false, |arr| {
            arr.retain(|e| !matcher::element_matches(e, preds));
            Ok(())
        }),
        UpdateOp::AddToSet(value) => with_array(doc, &fm.field, true, |arr| {
            if !arr.iter().any(|e| order::values_equal(e, value)) {
                arr.push(value.clone());
            }
            Ok(())
        }),
        UpdateOp::Pop(which) => with_array(doc, &fm.field, false, |arr| {
            if !arr.is_empty() {
                if *which == 1 {
                    arr.pop();
                } else {
                    arr.remove(0);
                }
            }
            Ok(())
        }),
    }
}

enum ArithOp {
    Add,
    Mul,
}

/// `$inc` / `$mul`. Integer width is preserved while the checked operation
/// fits; overflow promotes to double. A non-finite double result (from
/// finite operands) is a hard error.
fn apply_arith(doc: &mut Document, path: &str, amount: &Bson, op: ArithOp) -> Result<()> {
    let Some((parent, leaf)) = resolve_parent_mut(doc, path, true)? else {
        return Ok(());
    };

    let current = match parent.get(leaf) {
        None => match op {
            // missing field: $inc starts from zero, $mul yields zero
            ArithOp::Add => zero_of(amount),
            ArithOp::Mul => zero_of(amount),
        },
        Some(v @ (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))) => v.clone(),
        Some(_) => {
            return Err(DbError::BadUpdate(format!(
                "field '{path}' is not numeric"
            )));
        }
    };

    let result = match (&current, amount) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let exact = match op {
                ArithOp::Add => a.checked_add(*b),
                ArithOp::Mul => a.checked_mul(*b),
            };
            match exact {
                Some(n) => Bson::Int32(n),
                None => Bson::Double(apply_f64(*a as f64, *b as f64, &op)),
            }
        }
        (Bson::Double(_), _) | (_, Bson::Double(_)) => {
            let a = order::as_f64(&current).expect("numeric");
            let b = order::as_f64(amount).expect("numeric");
            let result = apply_f64(a, b, &op);
            if !result.is_finite() && a.is_finite() && b.is_finite() {
                return Err(DbError::Overflow(format!(
                    "arithmetic on '{path}' is not representable"
                )));
            }
            Bson::Double(result)
        }
        _ => {
            // both integers, at least one 64-bit
            let a = int_of(&current);
            let b = int_of(amount);
            let exact = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Mul => a.checked_mul(b),
            };
            match exact {
                Some(n) => Bson::Int64(n),
                None => Bson::Double(apply_f64(a as f64, b as f64, &op)),
            }
        }
    };

    parent.insert(leaf.to_string(), result);
    Ok(())
}

fn apply_f64(a: f64, b: f64, op: &ArithOp) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Mul => a * b,
    }
}

fn zero_of(amount: &Bson) -> Bson {
    match amount {
        Bson::Double(_) => Bson::Double(0.0),
        Bson::Int64(_) => Bson::Int64(0),
        _ => Bson::Int32(0),
    }
}

fn int_of(value: &Bson) -> i64 {
    match value {
        Bson::Int32(n) => *n as i64,
        Bson::Int64(n) => *n,
        _ => unreachable!("caller checked numeric integer"),
    }
}

/// `$min`/`$max`: keep the winner under the cross-type comparison; a missing
/// field always takes the operand.
fn apply_bound(
    doc: &mut Document,
    path: &str,
    value: &Bson,
    wanted: std::cmp::Ordering,
) -> Result<()> {
    let Some((parent, leaf)) = resolve_parent_mut(doc, path, true)? else {
        return Ok(());
    };
    let replace = match parent.get(leaf) {
        None => true,
        Some(current) => order::compare(value, current) == wanted,
    };
    if replace {
        parent.insert(leaf.to_string(), value.clone());
    }
    Ok(())
}

fn with_array(
    doc: &mut Document,
    path: &str,
    create: bool,
    f: impl FnOnce(&mut Vec<Bson>) -> Result<()>,
) -> Result<()> {
    let Some((parent, leaf)) = resolve_parent_mut(doc, path, create)? else {
        return Ok(());
    };
    match parent.get_mut(leaf) {
        Some(Bson::Array(arr)) => f(arr),
        Some(_) => Err(DbError::BadUpdate(format!(
            "field '{path}' is not an array"
        ))),
        None if create => {
            let mut arr = Vec::new();
            f(&mut arr)?;
            parent.insert(leaf.to_string(), Bson::Array(arr));
            Ok(())
        }
        None => Ok(()),
    }
}

/// Resolve a dotted path to its parent document and leaf field name,
/// creating missing intermediate sub-documents when `create` is set.
/// Returns `None` when an intermediate is missing and `create` is false.
fn resolve_parent_mut<'a, 'p>(
    doc: &'a mut Document,
    path: &'p str,
    create: bool,
) -> Result<Option<(&'a mut Document, &'p str)>> {
    match path.split_once('.') {
        None => Ok(Some((doc, path))),
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                if !create {
                    return Ok(None);
                }
                doc.insert(head.to_string(), Bson::Document(Document::new()));
            }
            match doc.get_mut(head) {
                Some(Bson::Document(sub)) => resolve_parent_mut(sub, rest, create),
                Some(_) => Err(DbError::BadUpdate(format!(
                    "path '{path}': '{head}' is not a document"
                ))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn parse(update: &Document) -> UpdateDoc {
        parse_update(update, &RegexCache::default()).unwrap()
    }

    fn apply(doc: &Document, update: Document) -> Document {
        match parse(&update) {
            UpdateDoc::Operators(u) => u.apply(doc).unwrap(),
            UpdateDoc::Replacement(_) => panic!("expected operator update"),
        }
    }

    #[test]
    fn replacement_shape_detected() {
        assert!(matches!(
            parse(&doc! { "name": "x", "age": 3 }),
            UpdateDoc::Replacement(_)
        ));
        assert!(matches!(
            parse(&doc! { "$set": { "a": 1 } }),
            UpdateDoc::Operators(_)
        ));
    }

    #[test]
    fn mixed_shape_rejected() {
        let err = parse_update(&doc! { "$set": { "a": 1 }, "b": 2 }, &RegexCache::default());
        assert!(matches!(err, Err(DbError::BadUpdate(_))));
    }

    #[test]
    fn unknown_operator_rejected() {
        let err = parse_update(&doc! { "$bump": { "a": 1 } }, &RegexCache::default());
        assert!(matches!(err, Err(DbError::BadUpdate(_))));
    }

    #[test]
    fn id_targets_rejected() {
        assert!(matches!(
            parse_update(&doc! { "$set": { "_id": 2 } }, &RegexCache::default()),
            Err(DbError::ImmutableId)
        ));
        assert!(matches!(
            parse_update(&doc! { "$rename": { "a": "_id" } }, &RegexCache::default()),
            Err(DbError::ImmutableId)
        ));
        assert!(matches!(
            parse_update(&doc! { "$unset": { "_id.sub": "" } }, &RegexCache::default()),
            Err(DbError::ImmutableId)
        ));
    }

    #[test]
    fn set_and_unset() {
        let d = doc! { "a": 1, "b": 2 };
        let out = apply(&d, doc! { "$set": { "a": 10, "c": 3 }, "$unset": { "b": "" } });
        assert_eq!(out, doc! { "a": 10, "c": 3 });
    }

    #[test]
    fn unset_runs_before_set() {
        let d = doc! { "a": 1 };
        let out = apply(&d, doc! { "$unset": { "a": "" }, "$set": { "a": 5 } });
        assert_eq!(out.get("a"), Some(&Bson::Int32(5)));
        // and in the other written order too
        let out = apply(&d, doc! { "$set": { "a": 5 }, "$unset": { "a": "" } });
        assert_eq!(out.get("a"), Some(&Bson::Int32(5)));
    }

    #[test]
    fn set_creates_nested_parents() {
        let d = doc! {};
        let out = apply(&d, doc! { "$set": { "address.city": "Austin" } });
        assert_eq!(out, doc! { "address": { "city": "Austin" } });
    }

    #[test]
    fn inc_preserves_integer_width() {
        let d = doc! { "small": 1_i32, "big": 1_i64, "f": 1.5 };
        let out = apply(&d, doc! { "$inc": { "small": 2, "big": 2, "f": 0.5 } });
        assert_eq!(out.get("small"), Some(&Bson::Int32(3)));
        assert_eq!(out.get("big"), Some(&Bson::Int64(3)));
        assert_eq!(out.get("f"), Some(&Bson::Double(2.0)));
    }

    #[test]
    fn inc_promotes_on_overflow() {
        let d = doc! { "n": i64::MAX };
        let out = apply(&d, doc! { "$inc": { "n": 1 } });
        match out.get("n") {
            Some(Bson::Double(f)) => assert!(*f > i64::MAX as f64 - 1.0),
            other => panic!("expected double, got {other:?}"),
        }
    }

    #[test]
    fn inc_missing_field_starts_from_zero() {
        let out = apply(&doc! {}, doc! { "$inc": { "n": 5 } });
        assert_eq!(out.get("n"), Some(&Bson::Int32(5)));
    }

    #[test]
    fn inc_non_numeric_field_errors() {
        let parsed = parse(&doc! { "$inc": { "s": 1 } });
        let UpdateDoc::Operators(u) = parsed else {
            panic!()
        };
        assert!(matches!(
            u.apply(&doc! { "s": "text" }),
            Err(DbError::BadUpdate(_))
        ));
    }

    #[test]
    fn mul_missing_field_yields_zero() {
        let out = apply(&doc! {}, doc! { "$mul": { "n": 5_i64 } });
        assert_eq!(out.get("n"), Some(&Bson::Int64(0)));
    }

    #[test]
    fn mul_multiplies() {
        let out = apply(&doc! { "n": 6 }, doc! { "$mul": { "n": 7 } });
        assert_eq!(out.get("n"), Some(&Bson::Int32(42)));
    }

    #[test]
    fn min_max_use_cross_type_order() {
        let d = doc! { "lo": 10, "hi": 10 };
        let out = apply(&d, doc! { "$min": { "lo": 3 }, "$max": { "hi": 3 } });
        assert_eq!(out.get("lo"), Some(&Bson::Int32(3)));
        assert_eq!(out.get("hi"), Some(&Bson::Int32(10)));

        // numbers rank below strings, so $min keeps the number
        let out = apply(&doc! { "v": 10 }, doc! { "$min": { "v": "s" } });
        assert_eq!(out.get("v"), Some(&Bson::Int32(10)));
        let out = apply(&doc! { "v": 10 }, doc! { "$max": { "v": "s" } });
        assert_eq!(out.get("v"), Some(&Bson::String("s".into())));
    }

    #[test]
    fn min_sets_missing_field() {
        let out = apply(&doc! {}, doc! { "$min": { "v": 4 } });
        assert_eq!(out.get("v"), Some(&Bson::Int32(4)));
    }

    #[test]
    fn rename_moves_across_paths() {
        let d = doc! { "a": { "b": 7 } };
        let out = apply(&d, doc! { "$rename": { "a.b": "c.d" } });
        assert_eq!(out, doc! { "a": {}, "c": { "d": 7 } });
    }

    #[test]
    fn rename_missing_source_is_noop() {
        let d = doc! { "a": 1 };
        let out = apply(&d, doc! { "$rename": { "x": "y" } });
        assert_eq!(out, d);
    }

    #[test]
    fn push_pull_add_to_set_pop() {
        let d = doc! { "tags": ["a", "b", "a"] };
        let out = apply(&d, doc! { "$push": { "tags": "c" } });
        assert_eq!(
            out.get("tags"),
            Some(&Bson::Array(vec!["a".into(), "b".into(), "a".into(), "c".into()]))
        );

        let out = apply(&d, doc! { "$pull": { "tags": "a" } });
        assert_eq!(out.get("tags"), Some(&Bson::Array(vec!["b".into()])));

        let out = apply(&d, doc! { "$addToSet": { "tags": "b" } });
        assert_eq!(out, d);
        let out = apply(&d, doc! { "$addToSet": { "tags": "z" } });
        assert_eq!(
            out.get("tags"),
            Some(&Bson::Array(vec!["a".into(), "b".into(), "a".into(), "z".into()]))
        );

        let out = apply(&d, doc! { "$pop": { "tags": 1 } });
        assert_eq!(out.get("tags"), Some(&Bson::Array(vec!["a".into(), "b".into()])));
        let out = apply(&d, doc! { "$pop": { "tags": -1 } });
        assert_eq!(out.get("tags"), Some(&Bson::Array(vec!["b".into(), "a".into()])));
    }

    #[test]
    fn push_creates_array() {
        let out = apply(&doc! {}, doc! { "$push": { "tags": "x" } });
        assert_eq!(out.get("tags"), Some(&Bson::Array(vec!["x".into()])));
    }

    #[test]
    fn pull_with_condition() {
        let d = doc! { "scores": [3, 9, 5, 12] };
        let out = apply(&d, doc! { "$pull": { "scores": { "$gte": 6 } } });
        assert_eq!(
            out.get("scores"),
            Some(&Bson::Array(vec![Bson::Int32(3), Bson::Int32(5)]))
        );
    }

    #[test]
    fn push_to_non_array_errors() {
        let parsed = parse(&doc! { "$push": { "v": 1 } });
        let UpdateDoc::Operators(u) = parsed else {
            panic!()
        };
        assert!(matches!(
            u.apply(&doc! { "v": "scalar" }),
            Err(DbError::BadUpdate(_))
        ));
    }

    #[test]
    fn idempotent_set_leaves_document_identical() {
        let d = doc! { "a": 1, "b": "x" };
        let out = apply(&d, doc! { "$set": { "a": 1 } });
        assert_eq!(out, d);
        assert_eq!(bson::serialize_to_vec(&out).unwrap(), bson::serialize_to_vec(&d).unwrap());
    }

    #[test]
    fn non_finite_double_result_overflows() {
        let parsed = parse(&doc! { "$mul": { "v": f64::MAX } });
        let UpdateDoc::Operators(u) = parsed else {
            panic!()
        };
        assert!(matches!(
            u.apply(&doc! { "v": f64::MAX }),
            Err(DbError::Overflow(_))
        ));
    }

    #[test]
    fn pop_rejects_other_values() {
        assert!(parse_update(&doc! { "$pop": { "a": 2 } }, &RegexCache::default()).is_err());
    }
}

//! Filter compilation.
//!
//! A filter document compiles into a [`Filter`] tree once per query; the
//! matcher then evaluates the tree against candidate documents. Compilation
//! is where every shape error surfaces ([`DbError::BadQuery`]) — evaluation
//! is infallible.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bson::spec::ElementType;
use bson::{Bson, Document};
use regex::Regex;

use crate::error::{DbError, Result};
use crate::order;

#[derive(Debug, Clone)]
pub enum Filter {
    /// Empty filter — matches every document.
    All,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, preds: Vec<Pred> },
}

#[derive(Debug, Clone)]
pub enum Pred {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
    Type(Vec<ElementType>),
    All(Vec<Bson>),
    Size(i64),
    Regex(Arc<Regex>),
    /// `$elemMatch` with a sub-filter — matches document elements.
    ElemMatchFilter(Box<Filter>),
    /// `$elemMatch` with an operator document — matches scalar elements.
    ElemMatchPreds(Vec<Pred>),
    Not(Vec<Pred>),
}

/// Compiled-regex cache keyed by `(pattern, options)`.
///
/// Owned by the database handle; filters hold the shared compiled program
/// behind an `Arc`, so cached entries survive as long as any cursor uses
/// them.
#[derive(Default)]
pub struct RegexCache {
    map: Mutex<HashMap<(String, String), Arc<Regex>>>,
}

impl RegexCache {
    pub fn compile(&self, pattern: &str, options: &str) -> Result<Arc<Regex>> {
        let key = (pattern.to_string(), options.to_string());
        if let Some(re) = self.map.lock().unwrap().get(&key) {
            return Ok(re.clone());
        }

        let mut flags = String::new();
        for ch in options.chars() {
            match ch {
                'i' | 'm' | 's' | 'x' => flags.push(ch),
                c => return Err(DbError::BadQuery(format!("unknown regex option: {c}"))),
            }
        }
        let full = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{flags}){pattern}")
        };
        let re = Arc::new(
            Regex::new(&full)
                .map_err(|e| DbError::BadQuery(format!("invalid regex pattern: {e}")))?,
        );
        self.map.lock().unwrap().insert(key, re.clone());
        Ok(re)
    }
}

/// Compile a filter document into a [`Filter`] tree.
///
/// # Errors
///
/// `BadQuery` on unknown operators, malformed `$regex`, non-array `$in`,
/// non-boolean `$exists`, and every other shape violation.
pub fn compile(filter: &Document, cache: &RegexCache) -> Result<Filter> {
    compile_at(filter, cache)
}

fn compile_at(doc: &Document, cache: &RegexCache) -> Result<Filter> {
    if doc.is_empty() {
        return Ok(Filter::All);
    }

    let mut children = Vec::new();
    for (key, value) in doc.iter() {
        match key.as_str() {
            "$and" => children.push(Filter::And(logical_children(key, value, cache)?)),
            "$or" => children.push(Filter::Or(logical_children(key, value, cache)?)),
            "$nor" => children.push(Filter::Nor(logical_children(key, value, cache)?)),
            k if k.starts_with('$') => {
                return Err(DbError::BadQuery(format!(
                    "unknown top-level operator: {k}"
                )));
            }
            path => children.push(compile_field(path, value, cache)?),
        }
    }

    if children.len() == 1 {
        Ok(children.pop().expect("one child"))
    } else {
        Ok(Filter::And(children))
    }
}

fn logical_children(op: &str, value: &Bson, cache: &RegexCache) -> Result<Vec<Filter>> {
    let arr = match value {
        Bson::Array(arr) => arr,
        _ => return Err(DbError::BadQuery(format!("{op} requires an array"))),
    };
    if arr.is_empty() {
        return Err(DbError::BadQuery(format!("{op} array must not be empty")));
    }
    let mut children = Vec::with_capacity(arr.len());
    for elem in arr {
        match elem {
            Bson::Document(sub) => children.push(compile_at(sub, cache)?),
            _ => {
                return Err(DbError::BadQuery(format!(
                    "{op} array elements must be documents"
                )));
            }
        }
    }
    Ok(children)
}

fn compile_field(path: &str, value: &Bson, cache: &RegexCache) -> Result<Filter> {
    if path.is_empty() {
        return Err(DbError::BadQuery("empty field path".into()));
    }
    let preds = match value {
        Bson::Document(cond) if is_operator_doc(cond) => parse_operator_doc(cond, cache)?,
        Bson::RegularExpression(re) => {
            let (pattern, options) = order::regex_parts(re);
            vec![Pred::Regex(cache.compile(&pattern, &options)?)]
        }
        other => vec![Pred::Eq(other.clone())],
    };
    Ok(Filter::Field {
        path: path.to_string(),
        preds,
    })
}

/// A sub-document is an operator document when its first key is a `$`-name;
/// otherwise it is a literal value for implicit equality.
pub(crate) fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

pub(crate) fn parse_operator_doc(cond: &Document, cache: &RegexCache) -> Result<Vec<Pred>> {
    if cond.contains_key("$options") && !cond.contains_key("$regex") {
        return Err(DbError::BadQuery("$options without $regex".into()));
    }

    let mut preds = Vec::new();

    // $regex pairs with an optional $options sibling, so it is pulled out
    // before the per-operator loop.
    if let Some(pattern_val) = cond.get("$regex") {
        let pattern = match pattern_val {
            Bson::String(s) => s.clone(),
            Bson::RegularExpression(re) => order::regex_parts(re).0,
            _ => return Err(DbError::BadQuery("$regex requires a string pattern".into())),
        };
        let options = match cond.get("$options") {
            None => String::new(),
            Some(Bson::String(s)) => s.clone(),
            Some(_) => return Err(DbError::BadQuery("$options requires a string".into())),
        };
        preds.push(Pred::Regex(cache.compile(&pattern, &options)?));
    }

    for (op, arg) in cond.iter() {
        let pred = match op.as_str() {
            "$regex" | "$options" => continue,
            "$eq" => Pred::Eq(arg.clone()),
            "$ne" => Pred::Ne(arg.clone()),
            "$gt" => Pred::Gt(arg.clone()),
            "$gte" => Pred::Gte(arg.clone()),
            "$lt" => Pred::Lt(arg.clone()),
            "$lte" => Pred::Lte(arg.clone()),
            "$in" => Pred::In(operand_array(op, arg)?),
            "$nin" => Pred::Nin(operand_array(op, arg)?),
            "$all" => Pred::All(operand_array(op, arg)?),
            "$exists" => match arg {
                Bson::Boolean(b) => Pred::Exists(*b),
                _ => return Err(DbError::BadQuery("$exists requires a boolean".into())),
            },
            "$size" => match arg {
                Bson::Int32(n) => Pred::Size(*n as i64),
                Bson::Int64(n) => Pred::Size(*n),
                _ => return Err(DbError::BadQuery("$size requires an integer".into())),
            },
            "$type" => Pred::Type(parse_type_spec(arg)?),
            "$not" => match arg {
                Bson::Document(inner) if is_operator_doc(inner) => {
                    Pred::Not(parse_operator_doc(inner, cache)?)
                }
                Bson::RegularExpression(re) => {
                    let (pattern, options) = order::regex_parts(re);
                    Pred::Not(vec![Pred::Regex(cache.compile(&pattern, &options)?)])
                }
                _ => {
                    return Err(DbError::BadQuery(
                        "$not requires an operator document or regex".into(),
                    ));
                }
            },
            "$elemMatch" => match arg {
                Bson::Document(inner) if is_operator_doc(inner) => {
                    Pred::ElemMatchPreds(parse_operator_doc(inner, cache)?)
                }
                Bson::Document(inner) => {
                    Pred::ElemMatchFilter(Box::new(compile_at(inner, cache)?))
                }
                _ => return Err(DbError::BadQuery("$elemMatch requires a document".into())),
            },
            k if k.starts_with('$') => {
                return Err(DbError::BadQuery(format!("unknown operator: {k}")));
            }
            k => {
                return Err(DbError::BadQuery(format!(
                    "unexpected field '{k}' in operator document"
                )));
            }
        };
        preds.push(pred);
    }

    if preds.is_empty() {
        return Err(DbError::BadQuery("empty operator document".into()));
    }
    Ok(preds)
}

fn operand_array(op: &str, arg: &Bson) -> Result<Vec<Bson>> {
    match arg {
        Bson::Array(arr) => Ok(arr.clone()),
        _ => Err(DbError::BadQuery(format!("{op} requires an array"))),
    }
}

/// `$type` accepts a numeric code, a canonical name, or an array of either.
fn parse_type_spec(arg: &Bson) -> Result<Vec<ElementType>> {
    match arg {
        Bson::Array(arr) => {
            if arr.is_empty() {
                return Err(DbError::BadQuery("$type array must not be empty".into()));
            }
            let mut types = Vec::new();
            for elem in arr {
                types.extend(parse_single_type(elem)?);
            }
            Ok(types)
        }
        other => parse_single_type(other),
    }
}

fn parse_single_type(arg: &Bson) -> Result<Vec<ElementType>> {
    match arg {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let code = match arg {
                Bson::Int32(n) => *n as i64,
                Bson::Int64(n) => *n,
                Bson::Double(f) if f.fract() == 0.0 => *f as i64,
                _ => return Err(DbError::BadQuery("invalid numeric type code".into())),
            };
            let byte = u8::try_from(code)
                .map_err(|_| DbError::BadQuery(format!("unknown type code: {code}")))?;
            let ty = ElementType::from(byte)
                .ok_or_else(|| DbError::BadQuery(format!("unknown type code: {code}")))?;
            Ok(vec![ty])
        }
        Bson::String(name) => match name.as_str() {
            "double" => Ok(vec![ElementType::Double]),
            "string" => Ok(vec![ElementType::String]),
            "object" => Ok(vec![ElementType::EmbeddedDocument]),
            "array" => Ok(vec![ElementType::Array]),
            "binData" => Ok(vec![ElementType::Binary]),
            "objectId" => Ok(vec![ElementType::ObjectId]),
            "bool" => Ok(vec![ElementType::Boolean]),
            "date" => Ok(vec![ElementType::DateTime]),
            "null" => Ok(vec![ElementType::Null]),
            "regex" => Ok(vec![ElementType::RegularExpression]),
            "int" => Ok(vec![ElementType::Int32]),
            "timestamp" => Ok(vec![ElementType::Timestamp]),
            "long" => Ok(vec![ElementType::Int64]),
            "number" => Ok(vec![
                ElementType::Int32,
                ElementType::Int64,
                ElementType::Double,
            ]),
            other => Err(DbError::BadQuery(format!("unknown type name: {other}"))),
        },
        _ => Err(DbError::BadQuery(
            "$type requires a numeric code or type name".into(),
        )),
    }
}

//! Key encoding.
//!
//! Subtree layout: one metadata tree (`_sys`), one primary tree per
//! collection (`col:<name>`), one duplicate-sorted tree per index
//! (`idx:col:<collection>:<index>`).
//!
//! Primary keys and index keys are built from self-terminating *components*:
//!
//! ```text
//! ascending:   [tag] [escaped payload] [0x00]
//! descending:  [!tag] [inverted escaped payload] [0xFF]
//! ```
//!
//! The payload escape maps `0x00 -> 0x01 0x02` and `0x01 -> 0x01 0x03`, so
//! the ascending stream never contains `0x00` and the terminator is
//! unambiguous; the escape is order-preserving, and for descending fields
//! the escaped bytes are inverted (stream `<= 0xFE`, terminator `0xFF`), so
//! ascending tree iteration yields descending field order. Type tags follow
//! the cross-type precedence ranking, and all three numeric types share one
//! tag with a common order-preserving double transform so equal numbers
//! produce equal key bytes regardless of width.
//!
//! A full index entry key is `composite_prefix ++ primary_key`, which makes
//! the tree duplicate-sorted on `(composite_key, _id)`; the entry value is
//! the primary key alone.

use bson::{Bson, Document};

use crate::catalog::{Direction, IndexField};
use crate::matcher;

pub(crate) const COMPONENT_SEP: u8 = 0x00;

const ESC: u8 = 0x01;
const ESC_ZERO: u8 = 0x02;
const ESC_ONE: u8 = 0x03;

const TAG_NULL: u8 = 0x05;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x20;
const TAG_DOCUMENT: u8 = 0x30;
const TAG_ARRAY: u8 = 0x35;
const TAG_BINARY: u8 = 0x40;
const TAG_OBJECT_ID: u8 = 0x45;
const TAG_BOOL: u8 = 0x50;
const TAG_DATETIME: u8 = 0x55;
const TAG_TIMESTAMP: u8 = 0x60;
const TAG_REGEX: u8 = 0x65;

// ── Tree names ──────────────────────────────────────────────────

pub(crate) fn collection_tree(name: &str) -> String {
    format!("col:{name}")
}

pub(crate) fn index_tree(collection: &str, index: &str) -> String {
    format!("idx:col:{collection}:{index}")
}

// ── Primary keys ────────────────────────────────────────────────

/// Canonical byte form of an `_id` value: one ascending component.
pub(crate) fn primary_key(id: &Bson) -> Vec<u8> {
    let mut out = Vec::new();
    encode_component(Some(id), Direction::Asc, &mut out);
    out
}

// ── Composite index keys ────────────────────────────────────────

pub(crate) struct CompositeKey {
    /// Concatenated components in key-spec order (each self-terminated).
    pub prefix: Vec<u8>,
    /// Whether any indexed field was absent or null in the document.
    pub has_missing_or_null: bool,
}

/// Composite key of a document under an index key spec. Absent fields
/// encode as null.
pub(crate) fn composite_prefix(keys: &[IndexField], doc: &Document) -> CompositeKey {
    let mut prefix = Vec::new();
    let mut has_missing_or_null = false;
    for key in keys {
        let value = matcher::get_path(doc, &key.field);
        if matches!(value, None | Some(Bson::Null)) {
            has_missing_or_null = true;
        }
        encode_component(value, key.direction, &mut prefix);
    }
    CompositeKey {
        prefix,
        has_missing_or_null,
    }
}

/// Seek prefix for an equality match on the first `values.len()` fields of
/// the key spec.
pub(crate) fn seek_prefix(keys: &[IndexField], values: &[Bson]) -> Vec<u8> {
    debug_assert!(values.len() <= keys.len());
    let mut out = Vec::new();
    for (key, value) in keys.iter().zip(values.iter()) {
        encode_component(Some(value), key.direction, &mut out);
    }
    out
}

/// Full index entry key: the composite prefix followed by the primary key.
pub(crate) fn entry_key(prefix: &[u8], primary: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + primary.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(primary);
    key
}

// ── Component encoding ──────────────────────────────────────────

fn encode_component(value: Option<&Bson>, direction: Direction, out: &mut Vec<u8>) {
    let (tag, payload) = raw_payload(value.unwrap_or(&Bson::Null));
    match direction {
        Direction::Asc => {
            out.push(tag);
            escape_into(&payload, out);
            out.push(COMPONENT_SEP);
        }
        Direction::Desc => {
            out.push(!tag);
            let start = out.len();
            escape_into(&payload, out);
            for b in &mut out[start..] {
                *b = !*b;
            }
            out.push(0xFF);
        }
    }
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &b in payload {
        match b {
            0x00 => out.extend_from_slice(&[ESC, ESC_ZERO]),
            0x01 => out.extend_from_slice(&[ESC, ESC_ONE]),
            other => out.push(other),
        }
    }
}

/// Tag plus raw (unescaped) payload bytes for a value. The payload orders
/// byte-lexicographically consistently with the cross-type comparator.
fn raw_payload(value: &Bson) -> (u8, Vec<u8>) {
    match value {
        Bson::Null | Bson::Undefined => (TAG_NULL, Vec::new()),
        Bson::Int32(n) => (TAG_NUMBER, number_bytes(*n as f64).to_vec()),
        Bson::Int64(n) => (TAG_NUMBER, number_bytes(*n as f64).to_vec()),
        Bson::Double(f) => (TAG_NUMBER, number_bytes(*f).to_vec()),
        Bson::String(s) => (TAG_STRING, s.as_bytes().to_vec()),
        Bson::Document(d) => {
            let mut payload = Vec::new();
            for (k, v) in d.iter() {
                payload.extend_from_slice(k.as_bytes());
                payload.push(0x00);
                encode_component(Some(v), Direction::Asc, &mut payload);
            }
            (TAG_DOCUMENT, payload)
        }
        Bson::Array(arr) => {
            let mut payload = Vec::new();
            for elem in arr {
                encode_component(Some(elem), Direction::Asc, &mut payload);
            }
            (TAG_ARRAY, payload)
        }
        Bson::Binary(bin) => (TAG_BINARY, bin.bytes.clone()),
        Bson::ObjectId(oid) => (TAG_OBJECT_ID, oid.bytes().to_vec()),
        Bson::Boolean(b) => (TAG_BOOL, vec![*b as u8]),
        Bson::DateTime(dt) => {
            let flipped = (dt.timestamp_millis() as u64) ^ (1u64 << 63);
            (TAG_DATETIME, flipped.to_be_bytes().to_vec())
        }
        Bson::Timestamp(ts) => {
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&ts.time.to_be_bytes());
            payload.extend_from_slice(&ts.increment.to_be_bytes());
            (TAG_TIMESTAMP, payload)
        }
        Bson::RegularExpression(re) => {
            let (pattern, options) = crate::order::regex_parts(re);
            let mut payload = pattern.into_bytes();
            payload.push(0x00);
            payload.extend_from_slice(options.as_bytes());
            (TAG_REGEX, payload)
        }
        _ => (TAG_NULL, Vec::new()),
    }
}

/// Order-preserving byte form of a double. Negative zero normalizes to zero
/// and NaN gets the all-zero payload, sorting below every other number.
fn number_bytes(f: f64) -> [u8; 8] {
    if f.is_nan() {
        return [0u8; 8];
    }
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    let sortable = if bits >> 63 == 1 {
        !bits
    } else {
        bits ^ (1u64 << 63)
    };
    sortable.to_be_bytes()
}

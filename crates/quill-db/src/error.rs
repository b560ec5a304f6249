use std::fmt;

use quill_store::StoreError;

#[derive(Debug)]
pub enum DbError {
    /// Malformed argument: empty collection name, empty key spec, reserved
    /// name, bad option combination.
    Invalid(String),
    /// Collection or index missing where one is required.
    NotFound(String),
    /// Name collision with incompatible options.
    Exists(String),
    /// Primary-key collision on insert.
    DuplicateId(String),
    /// A unique index rejected a composite key.
    UniqueViolation(String),
    /// Update or replace attempted to change `_id`.
    ImmutableId,
    /// Filter compilation failed.
    BadQuery(String),
    /// Update document uses unknown operators or invalid operand shapes.
    BadUpdate(String),
    /// Numeric operator produced a value outside the representable range.
    Overflow(String),
    /// Stored bytes could not be decoded.
    Corrupt(String),
    /// The database handle was closed.
    Closed,
    /// The storage engine surfaced an error.
    Storage(StoreError),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            DbError::NotFound(what) => write!(f, "not found: {what}"),
            DbError::Exists(what) => write!(f, "already exists: {what}"),
            DbError::DuplicateId(id) => write!(f, "duplicate _id: {id}"),
            DbError::UniqueViolation(msg) => write!(f, "unique index violation: {msg}"),
            DbError::ImmutableId => write!(f, "_id is immutable"),
            DbError::BadQuery(msg) => write!(f, "bad query: {msg}"),
            DbError::BadUpdate(msg) => write!(f, "bad update: {msg}"),
            DbError::Overflow(msg) => write!(f, "numeric overflow: {msg}"),
            DbError::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            DbError::Closed => write!(f, "database is closed"),
            DbError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<StoreError> for DbError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Config(msg) => DbError::Invalid(msg),
            StoreError::Corrupt(msg) => DbError::Corrupt(msg),
            other => DbError::Storage(other),
        }
    }
}

impl From<bson::error::Error> for DbError {
    fn from(e: bson::error::Error) -> Self {
        DbError::Corrupt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

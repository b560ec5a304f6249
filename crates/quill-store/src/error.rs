use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    /// The transaction was already committed or rolled back.
    TransactionConsumed,
    /// A write was attempted through a read-only transaction or store.
    ReadOnly,
    /// Invalid store configuration (zero map size, subtree limit, ...).
    Config(String),
    /// The requested subtree does not exist.
    TreeNotFound(String),
    /// Filesystem-level failure while opening or writing the store.
    Io(String),
    /// The on-disk state could not be interpreted.
    Corrupt(String),
    /// Any other backend failure (map full, internal error, ...).
    Storage(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::TransactionConsumed => write!(f, "transaction already consumed"),
            StoreError::ReadOnly => write!(f, "cannot write through a read-only handle"),
            StoreError::Config(msg) => write!(f, "invalid store configuration: {msg}"),
            StoreError::TreeNotFound(name) => write!(f, "subtree not found: {name}"),
            StoreError::Io(msg) => write!(f, "io error: {msg}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt store: {msg}"),
            StoreError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

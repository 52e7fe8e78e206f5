//! Error types for the storage engine.
//!
//! Follows the teacher's own choice of a hand-rolled error enum with manual
//! `Display`/`Error` impls rather than a derive-macro crate: each variant
//! maps directly onto one of the error kinds the kernel must distinguish.

use std::fmt;
use std::io;

/// Errors raised by any layer of the storage engine.
#[derive(Debug)]
pub enum StorageError {
    /// No transaction slot could be allocated or recycled on a page and the
    /// caller must release its page locks and retry rather than spin.
    SlotExhausted(String),
    /// The target page has no room for the new tuple image; callers should
    /// attempt a prune and then fall back to a non-in-place update.
    OutOfPageSpace(String),
    /// A cross-partition or constraint-violating update was attempted.
    SerializationFailure(String),
    /// A row lock could not be granted under the caller's wait policy.
    LockNotAvailable(String),
    /// The requested undo pointer lies below the log's discard horizon.
    UndoUnavailable(String),
    /// An on-disk or in-memory invariant was violated.
    Corruption(String),
    /// Underlying I/O failure.
    Io(String),
    /// Undo record or page codec failure.
    Codec(String),
    /// The requested row, page, or slot does not exist.
    NotFound(String),
    /// Caller-supplied arguments were invalid for the requested operation.
    InvalidInput(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotExhausted(msg) => write!(f, "transaction slots exhausted: {msg}"),
            Self::OutOfPageSpace(msg) => write!(f, "out of page space: {msg}"),
            Self::SerializationFailure(msg) => write!(f, "serialization failure: {msg}"),
            Self::LockNotAvailable(msg) => write!(f, "lock not available: {msg}"),
            Self::UndoUnavailable(msg) => write!(f, "undo pointer unavailable: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption detected: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, StorageError>;

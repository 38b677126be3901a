//! Error types for the ledger store

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Ledger store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Entry does not extend the tail by exactly one
    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// Next sequence the store would accept
        expected: u64,
        /// Sequence that was offered
        got: u64,
    },

    /// Entry's predecessor hash does not match the current tail
    #[error("Chain mismatch at sequence {sequence}")]
    ChainMismatch {
        /// Sequence of the rejected entry
        sequence: u64,
    },

    /// No entry stored under this sequence
    #[error("Entry not found: {0}")]
    NotFound(u64),

    /// Stored data failed an integrity check
    #[error("Corrupt ledger: {0}")]
    Corrupt(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error means durability can no longer be assumed.
    ///
    /// `SequenceGap` and `ChainMismatch` are recoverable through catch-up;
    /// everything touching the underlying store is not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Storage(_)
                | StoreError::Io(_)
                | StoreError::Corrupt(_)
                | StoreError::Serialization(_)
        )
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

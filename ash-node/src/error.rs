//! Error types for the node

use ash_ledger::{PublicKey, StoreError};
use thiserror::Error;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Frame decoding errors
///
/// Never fatal to a session: the frame is dropped and reading continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Structurally invalid envelope
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Frame or payload larger than allowed
    #[error("Oversized frame: {size} bytes exceeds {max}")]
    Oversized {
        /// Observed size
        size: usize,
        /// Configured limit
        max: usize,
    },
}

/// Handshake errors; the session is closed and not retried from this side
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Proof or challenge signature did not verify
    #[error("Invalid identity proof")]
    InvalidProof,

    /// Handshake not completed within the deadline
    #[error("Handshake timed out")]
    Timeout,

    /// Peer sent something other than a challenge or proof
    #[error("Unexpected message during handshake: {0}")]
    UnexpectedMessage(String),

    /// Peer key is ours or not on the allow list
    #[error("Peer not allowed: {0}")]
    NotAllowed(PublicKey),

    /// Connection failed mid-handshake
    #[error("Transport error during handshake: {0}")]
    Transport(String),
}

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Outbound queue full; the session was dropped
    #[error("Session overloaded")]
    Overloaded,

    /// Session no longer registered
    #[error("Session closed")]
    Closed,

    /// WebSocket or TCP failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Handshake failure
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    /// Ledger store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Ledger durability can no longer be assumed; the node must stop
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

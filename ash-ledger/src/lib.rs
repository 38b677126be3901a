//! Ash Ledger
//!
//! Durable, append-only, hash-linked ledger for replicated updates.
//!
//! # Architecture
//!
//! - **Single Writer**: `append` is serialized; readers never block it
//! - **Hash Chain**: every entry commits to its predecessor's hash
//! - **Synced Writes**: an entry is acknowledged only after fsync
//!
//! # Invariants
//!
//! - Contiguous: sequences run 1..=tail with no holes
//! - Linked: `entry[n].predecessor_hash == hash(entry[n-1])`
//! - Append-only: entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod types;

// Re-exports
pub use audit::{verify_chain, AuditReport};
pub use clock::HybridClock;
pub use config::{RocksDBConfig, StoreConfig};
pub use crypto::KeyPair;
pub use error::{Result, StoreError};
pub use storage::{ChainTail, EntryLog, LedgerRange, LedgerStore};
pub use types::{Digest, LedgerEntry, LogicalTime, PublicKey, Signature};

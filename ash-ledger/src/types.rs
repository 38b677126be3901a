//! Core types for the ledger
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode)
//! - Fixed-size digests and keys (no length ambiguity on the wire)

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a SHA-256 digest
pub const DIGEST_LEN: usize = 32;

/// Size of an Ed25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// SHA-256 digest used for payload hashes and chain links
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Link target of the first entry in the chain
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, `None` unless it is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Parse lowercase or uppercase hex
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Full lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the all-zero digest
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for log lines
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Ed25519 public key identifying a peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, `None` unless it is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Parse hex
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Full lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Fingerprint: first 8 bytes of the key in hex
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Digital signature (Ed25519)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, `None` unless it is exactly 64 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    /// Full lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", &self.to_hex()[..16])
    }
}

/// Hybrid logical clock timestamp
///
/// Ordered by physical milliseconds first, then the logical counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LogicalTime {
    /// Wall-clock milliseconds since the UNIX epoch (never decreasing)
    pub physical_ms: u64,
    /// Counter for events within the same millisecond
    pub logical: u32,
}

impl LogicalTime {
    /// Create a timestamp
    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Self {
            physical_ms,
            logical,
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_ms, self.logical)
    }
}

/// Durably accepted, hash-linked ledger record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Position in the chain, starting at 1
    pub sequence: u64,

    /// Opaque update bytes
    pub payload: Vec<u8>,

    /// When this node accepted the entry
    pub accepted_at: LogicalTime,

    /// Hash of the entry at `sequence - 1` (zero for the first entry)
    pub predecessor_hash: Digest,
}

impl LedgerEntry {
    /// Chain hash of this entry
    ///
    /// `accepted_at` is local to the accepting node and is not part of the hash.
    pub fn hash(&self) -> Digest {
        crate::crypto::entry_hash(self.sequence, &self.predecessor_hash, &self.payload)
    }

    /// Whether `other` carries the same update at the same chain position
    pub fn same_update(&self, other: &LedgerEntry) -> bool {
        self.sequence == other.sequence
            && self.predecessor_hash == other.predecessor_hash
            && self.payload == other.payload
    }
}

/// Persisted value under a sequence key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub payload: Vec<u8>,
    pub predecessor_hash: Digest,
    pub accepted_at: LogicalTime,
}

impl StoredEntry {
    pub(crate) fn from_entry(entry: &LedgerEntry) -> Self {
        Self {
            payload: entry.payload.clone(),
            predecessor_hash: entry.predecessor_hash,
            accepted_at: entry.accepted_at,
        }
    }

    pub(crate) fn into_entry(self, sequence: u64) -> LedgerEntry {
        LedgerEntry {
            sequence,
            payload: self.payload,
            accepted_at: self.accepted_at,
            predecessor_hash: self.predecessor_hash,
        }
    }
}

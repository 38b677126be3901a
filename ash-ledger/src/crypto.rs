//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - Ed25519 key pair generation, loading, signing, and verification
//! - SHA-256 hashing for payloads and chain links
//! - Merkle roots over entry hashes for audit summaries

use crate::types::{Digest, PublicKey, Signature};
use crate::{Result, StoreError};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use std::path::Path;

/// Domain tag for chain-link hashes
const ENTRY_DOMAIN: &[u8] = b"ash.entry.v1";

/// Domain tag for handshake proofs
const HANDSHAKE_DOMAIN: &[u8] = b"ash.handshake.v1";

/// Ed25519 key pair for signing
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new key pair from the OS entropy source
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load a hex-encoded seed from `path`, creating the file if absent
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let bytes = hex::decode(content.trim())
                .map_err(|e| StoreError::Config(format!("Invalid key file {:?}: {}", path, e)))?;
            let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                StoreError::Config(format!("Key file {:?} must hold a 32-byte seed", path))
            })?;

            let keypair = Self::from_seed(&seed);
            tracing::info!(peer = %keypair.public_key(), "Loaded node key");
            return Ok(keypair);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keypair = Self::generate();
        std::fs::write(path, hex::encode(keypair.secret_key()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(peer = %keypair.public_key(), path = ?path, "Generated node key");
        Ok(keypair)
    }

    /// Get public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.verifying_key.to_bytes())
    }

    /// Get private key bytes (USE WITH CAUTION - should be protected)
    pub fn secret_key(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(self.signing_key.sign(message).to_bytes())
    }
}

/// Sign `message` with `keypair`
pub fn sign(keypair: &KeyPair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

/// Verify a signature with a public key
///
/// Returns false for any malformed key or signature; never panics.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(public_key.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_bytes(hasher.finalize().into())
}

/// Chain hash of an entry
pub fn entry_hash(sequence: u64, predecessor_hash: &Digest, payload: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(ENTRY_DOMAIN);
    hasher.update(sequence.to_be_bytes());
    hasher.update(predecessor_hash.as_bytes());
    hasher.update(payload);
    Digest::from_bytes(hasher.finalize().into())
}

/// Message signed during the handshake for a given nonce
pub fn handshake_message(nonce: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(HANDSHAKE_DOMAIN);
    hasher.update(nonce);
    Digest::from_bytes(hasher.finalize().into())
}

/// Create a Merkle root from entry hashes
///
/// If a level has odd length, the last hash is duplicated.
pub fn merkle_root(hashes: &[Digest]) -> Digest {
    if hashes.is_empty() {
        return Digest::ZERO;
    }

    let mut current_level: Vec<Digest> = hashes.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity((current_level.len() + 1) / 2);

        for pair in current_level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);

            let mut hasher = Sha256::new();
            hasher.update(left.as_bytes());
            hasher.update(right.as_bytes());
            next_level.push(Digest::from_bytes(hasher.finalize().into()));
        }

        current_level = next_level;
    }

    current_level[0]
}

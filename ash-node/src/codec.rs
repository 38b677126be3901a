//! Wire codec for envelopes
//!
//! One JSON object per WebSocket message. Binary fields travel as lowercase
//! hex, and `predecessor_hash` is present only when set:
//!
//! ```text
//! {"payload":"..","payload_hash":"..","predecessor_hash":"..",
//!  "sequence":4,"signature":"..","signer":"..","type":"update"}
//! ```
//!
//! Keys are emitted in a fixed order, so equal envelopes encode to equal bytes.

use crate::DecodeError;
use ash_ledger::{crypto, Digest, KeyPair, LedgerEntry, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Frame bytes allowed beyond the hex-encoded payload
pub const ENVELOPE_OVERHEAD: usize = 1024;

/// Envelope discriminator (`type` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Handshake nonce
    Challenge,
    /// Handshake answer to a peer's challenge
    Proof,
    /// Candidate ledger update
    Update,
    /// Ask a peer for a range of entries
    CatchupRequest,
    /// Already-accepted entry served for catch-up
    CatchupResponse,
}

impl EnvelopeKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Challenge => "challenge",
            EnvelopeKind::Proof => "proof",
            EnvelopeKind::Update => "update",
            EnvelopeKind::CatchupRequest => "catchup_request",
            EnvelopeKind::CatchupResponse => "catchup_response",
        }
    }

    /// Kinds that carry a ledger entry
    pub fn carries_entry(&self) -> bool {
        matches!(self, EnvelopeKind::Update | EnvelopeKind::CatchupResponse)
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed, hashed wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type
    pub kind: EnvelopeKind,
    /// Ledger sequence (0 for handshake and catch-up requests)
    pub sequence: u64,
    /// Opaque payload
    pub payload: Vec<u8>,
    /// SHA-256 of `payload`
    pub payload_hash: Digest,
    /// Ed25519 signature by `signer`
    pub signature: Signature,
    /// Sender's public key
    pub signer: PublicKey,
    /// Tail the update extends; required when the kind carries an entry
    pub predecessor_hash: Option<Digest>,
}

impl Envelope {
    /// Build and sign an envelope over `hash(payload)`
    pub fn signed(
        kind: EnvelopeKind,
        sequence: u64,
        payload: Vec<u8>,
        predecessor_hash: Option<Digest>,
        keypair: &KeyPair,
    ) -> Self {
        let payload_hash = crypto::hash(&payload);
        let signature = keypair.sign(payload_hash.as_bytes());

        Self {
            kind,
            sequence,
            payload,
            payload_hash,
            signature,
            signer: keypair.public_key(),
            predecessor_hash,
        }
    }

    /// Handshake challenge carrying our nonce
    pub fn challenge(nonce: [u8; 32], keypair: &KeyPair) -> Self {
        Self::signed(EnvelopeKind::Challenge, 0, nonce.to_vec(), None, keypair)
    }

    /// Answer to a peer's challenge
    ///
    /// The signature covers `handshake_message(nonce)` rather than the
    /// payload hash, so a challenge can never double as a proof.
    pub fn proof(nonce: &[u8], keypair: &KeyPair) -> Self {
        let payload_hash = crypto::hash(nonce);
        let signature = keypair.sign(crypto::handshake_message(nonce).as_bytes());

        Self {
            kind: EnvelopeKind::Proof,
            sequence: 0,
            payload: nonce.to_vec(),
            payload_hash,
            signature,
            signer: keypair.public_key(),
            predecessor_hash: None,
        }
    }

    /// Update announcing an accepted entry
    pub fn update(entry: &LedgerEntry, keypair: &KeyPair) -> Self {
        Self::for_entry(EnvelopeKind::Update, entry, keypair)
    }

    /// Catch-up response carrying an accepted entry
    pub fn catchup_response(entry: &LedgerEntry, keypair: &KeyPair) -> Self {
        Self::for_entry(EnvelopeKind::CatchupResponse, entry, keypair)
    }

    /// Catch-up request for `range`
    pub fn catchup_request(range: CatchUpRange, keypair: &KeyPair) -> Self {
        Self::signed(
            EnvelopeKind::CatchupRequest,
            0,
            range.encode().to_vec(),
            None,
            keypair,
        )
    }

    fn for_entry(kind: EnvelopeKind, entry: &LedgerEntry, keypair: &KeyPair) -> Self {
        Self::signed(
            kind,
            entry.sequence,
            entry.payload.clone(),
            Some(entry.predecessor_hash),
            keypair,
        )
    }

    /// Check `payload_hash == hash(payload)` and the signature over it
    pub fn verify(&self) -> bool {
        crypto::hash(&self.payload) == self.payload_hash
            && crypto::verify(&self.signer, self.payload_hash.as_bytes(), &self.signature)
    }

    /// Check a proof answers `nonce`
    pub fn verify_proof(&self, nonce: &[u8]) -> bool {
        self.kind == EnvelopeKind::Proof
            && self.payload == nonce
            && crypto::hash(&self.payload) == self.payload_hash
            && crypto::verify(
                &self.signer,
                crypto::handshake_message(nonce).as_bytes(),
                &self.signature,
            )
    }
}

/// Serialize an envelope
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    encode_text(envelope).into_bytes()
}

/// Serialize an envelope for a text frame
pub fn encode_text(envelope: &Envelope) -> String {
    let mut object = Map::new();
    object.insert(
        "type".to_string(),
        Value::String(envelope.kind.as_str().to_string()),
    );
    object.insert("sequence".to_string(), Value::from(envelope.sequence));
    object.insert(
        "payload".to_string(),
        Value::String(hex::encode(&envelope.payload)),
    );
    object.insert(
        "payload_hash".to_string(),
        Value::String(envelope.payload_hash.to_hex()),
    );
    object.insert(
        "signature".to_string(),
        Value::String(envelope.signature.to_hex()),
    );
    object.insert("signer".to_string(), Value::String(envelope.signer.to_hex()));
    if let Some(predecessor) = &envelope.predecessor_hash {
        object.insert(
            "predecessor_hash".to_string(),
            Value::String(predecessor.to_hex()),
        );
    }

    Value::Object(object).to_string()
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    sequence: u64,
    payload: String,
    payload_hash: String,
    signature: String,
    signer: String,
    #[serde(default)]
    predecessor_hash: Option<String>,
}

/// Largest encoded frame that can carry a `max_frame_size` payload
///
/// The payload travels hex-encoded, so it takes twice its size on the wire.
pub fn frame_limit(max_frame_size: usize) -> usize {
    max_frame_size
        .saturating_mul(2)
        .saturating_add(ENVELOPE_OVERHEAD)
}

/// Parse a frame, rejecting payloads over `max_frame_size`
pub fn decode(bytes: &[u8], max_frame_size: usize) -> Result<Envelope, DecodeError> {
    let frame_limit = frame_limit(max_frame_size);
    if bytes.len() > frame_limit {
        return Err(DecodeError::Oversized {
            size: bytes.len(),
            max: frame_limit,
        });
    }

    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let payload = hex::decode(&wire.payload)
        .map_err(|e| DecodeError::Malformed(format!("payload: {}", e)))?;
    if payload.len() > max_frame_size {
        return Err(DecodeError::Oversized {
            size: payload.len(),
            max: max_frame_size,
        });
    }

    let payload_hash = Digest::from_hex(&wire.payload_hash)
        .ok_or_else(|| malformed("payload_hash must be 32 hex-encoded bytes"))?;

    let signature = hex::decode(&wire.signature)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes))
        .ok_or_else(|| malformed("signature must be 64 hex-encoded bytes"))?;

    let signer = PublicKey::from_hex(&wire.signer)
        .ok_or_else(|| malformed("signer must be 32 hex-encoded bytes"))?;

    let predecessor_hash = match wire.predecessor_hash {
        Some(hex) => Some(
            Digest::from_hex(&hex)
                .ok_or_else(|| malformed("predecessor_hash must be 32 hex-encoded bytes"))?,
        ),
        None => None,
    };

    if wire.kind.carries_entry() {
        if wire.sequence == 0 {
            return Err(malformed("sequence must start at 1"));
        }
        if predecessor_hash.is_none() {
            return Err(DecodeError::Malformed(format!(
                "{} requires predecessor_hash",
                wire.kind
            )));
        }
    }

    Ok(Envelope {
        kind: wire.kind,
        sequence: wire.sequence,
        payload,
        payload_hash,
        signature,
        signer,
        predecessor_hash,
    })
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::Malformed(reason.to_string())
}

/// Inclusive sequence range requested for catch-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpRange {
    /// First missing sequence
    pub from: u64,
    /// Last missing sequence
    pub to: u64,
}

impl CatchUpRange {
    /// Payload form: `from_be || to_be`
    pub fn encode(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.from.to_be_bytes());
        bytes[8..].copy_from_slice(&self.to.to_be_bytes());
        bytes
    }

    /// Parse a catch-up request payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; 16] = payload
            .try_into()
            .map_err(|_| malformed("catch-up range must be 16 bytes"))?;

        let mut from = [0u8; 8];
        let mut to = [0u8; 8];
        from.copy_from_slice(&bytes[..8]);
        to.copy_from_slice(&bytes[8..]);

        let range = Self {
            from: u64::from_be_bytes(from),
            to: u64::from_be_bytes(to),
        };

        if range.from == 0 || range.from > range.to {
            return Err(DecodeError::Malformed(format!(
                "invalid catch-up range [{}, {}]",
                range.from, range.to
            )));
        }

        Ok(range)
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &CatchUpRange) -> bool {
        self.from <= other.from && other.to <= self.to
    }
}

impl std::fmt::Display for CatchUpRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

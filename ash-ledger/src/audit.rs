//! Chain verification
//!
//! Replays a run of entries and checks every link. Used on open when
//! `verify_on_open` is set, and by operators through `LedgerStore`.

use crate::{
    crypto,
    error::{Result, StoreError},
    storage::LedgerStore,
    types::Digest,
};

/// Summary of a verified run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    /// Number of entries checked
    pub entries: u64,
    /// Hash of the last entry checked
    pub tail_hash: Digest,
    /// Merkle root over the entry hashes, in sequence order
    pub merkle_root: Digest,
}

/// Verify that `[from, to]` is present and correctly linked
pub fn verify_chain(store: &LedgerStore, from: u64, to: u64) -> Result<AuditReport> {
    let from = from.max(1);

    let mut expected_link = if from == 1 {
        Digest::ZERO
    } else {
        store.get(from - 1)?.hash()
    };

    let range = store.range(from, to);
    let wanted = range.len();
    let mut hashes = Vec::with_capacity(wanted as usize);

    for entry in range {
        let entry = entry?;
        if entry.predecessor_hash != expected_link {
            tracing::error!(
                sequence = entry.sequence,
                expected = %expected_link,
                found = %entry.predecessor_hash,
                "Broken chain link"
            );
            return Err(StoreError::Corrupt(format!(
                "entry {} does not link to its predecessor",
                entry.sequence
            )));
        }

        expected_link = entry.hash();
        hashes.push(expected_link);
    }

    if (hashes.len() as u64) != wanted {
        return Err(StoreError::Corrupt(format!(
            "expected {} entries, found {}",
            wanted,
            hashes.len()
        )));
    }

    Ok(AuditReport {
        entries: wanted,
        tail_hash: expected_link,
        merkle_root: crypto::merkle_root(&hashes),
    })
}

//! Ledger blocks: batches of entries bound by a Merkle root.
//!
//! Every `block_size` entries a shard seals a block. Blocks chain to each
//! other by hash, giving auditors a coarse structure to verify before
//! walking individual entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::entry::{ChainHash, LedgerEntry};

/// A sealed batch of ledger entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerBlock {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Position of this block in the tenant's block chain, starting at 0.
    pub index: u64,
    /// Sequence of the first entry in the batch.
    pub start_sequence: u64,
    /// Sequence of the last entry in the batch (inclusive).
    pub end_sequence: u64,
    /// Merkle root over the batch's entry hashes, in insertion order.
    pub merkle_root: ChainHash,
    /// `block_hash` of the preceding block, or the zero hash.
    pub prev_block_hash: ChainHash,
    pub block_hash: ChainHash,
    pub sealed_at: DateTime<Utc>,
}

impl LedgerBlock {
    /// Seal a batch of entries into a block.
    pub fn seal(
        tenant_id: Uuid,
        index: u64,
        entries: &[LedgerEntry],
        prev_block_hash: ChainHash,
    ) -> Self {
        let hashes: Vec<ChainHash> = entries.iter().map(|e| e.entry_hash.clone()).collect();
        let merkle_root = merkle_root(&hashes);
        let start_sequence = entries.first().map_or(0, |e| e.sequence);
        let end_sequence = entries.last().map_or(0, |e| e.sequence);
        let block_hash = compute_block_hash(
            index,
            start_sequence,
            end_sequence,
            &merkle_root,
            &prev_block_hash,
        );
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            index,
            start_sequence,
            end_sequence,
            merkle_root,
            prev_block_hash,
            block_hash,
            sealed_at: Utc::now(),
        }
    }

    /// Re-derive the Merkle root from the batch and compare.
    pub fn covers(&self, entries: &[LedgerEntry]) -> bool {
        let hashes: Vec<ChainHash> = entries.iter().map(|e| e.entry_hash.clone()).collect();
        merkle_root(&hashes) == self.merkle_root
    }
}

/// Hash of the block header fields.
pub fn compute_block_hash(
    index: u64,
    start_sequence: u64,
    end_sequence: u64,
    merkle_root: &ChainHash,
    prev_block_hash: &ChainHash,
) -> ChainHash {
    let canonical =
        format!("{index}:{start_sequence}:{end_sequence}:{merkle_root}:{prev_block_hash}");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    ChainHash(format!("{:x}", hasher.finalize()))
}

/// Merkle root over a list of hashes.
///
/// Pairs are concatenated and re-hashed level by level; an odd trailing
/// hash is paired with itself. Empty input yields the zero hash.
pub fn merkle_root(hashes: &[ChainHash]) -> ChainHash {
    if hashes.is_empty() {
        return ChainHash::zero();
    }

    let mut level: Vec<Vec<u8>> = hashes
        .iter()
        .map(|h| {
            let mut hasher = Sha256::new();
            hasher.update(h.0.as_bytes());
            hasher.finalize().to_vec()
        })
        .collect();

    while level.len() > 1 {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
        for chunk in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(&chunk[0]);
            if chunk.len() > 1 {
                hasher.update(&chunk[1]);
            } else {
                hasher.update(&chunk[0]);
            }
            next_level.push(hasher.finalize().to_vec());
        }
        level = next_level;
    }

    ChainHash(
        level[0]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>(),
    )
}

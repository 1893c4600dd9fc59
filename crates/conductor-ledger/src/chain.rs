//! The ledger: per-tenant hash chains with signed entries.
//!
//! # Sharding
//!
//! Chains are sharded by tenant. Each tenant owns an independent chain with
//! its own monotonic sequence, so concurrent workflows of different tenants
//! append without contending. Entries within one tenant are totally ordered;
//! **no global order across tenants is guaranteed** — cross-tenant audits go
//! through [`Ledger::verify_all`], which checks every shard independently.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use conductor_core::{ConductorError, Result};

use crate::block::LedgerBlock;
use crate::entry::{hash_canonical, hash_payload, ChainHash, EntryDraft, LedgerEntry};
use crate::signer::{verify_signature, LedgerSigner};
use crate::storage::LedgerStore;

/// Result of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainStatus {
    /// Every checked entry is intact.
    Valid { entries: u64 },
    /// The chain is broken; `sequence` is the first bad entry.
    Corrupted { sequence: u64, reason: String },
}

impl ChainStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainStatus::Valid { .. })
    }

    /// Map a corruption report onto the error taxonomy.
    pub fn into_result(self) -> Result<u64> {
        match self {
            ChainStatus::Valid { entries } => Ok(entries),
            ChainStatus::Corrupted { sequence, reason } => {
                Err(ConductorError::CorruptionDetected { sequence, reason })
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: Vec<LedgerEntry>,
    blocks: Vec<LedgerBlock>,
    head: Option<ChainHash>,
    /// Index of the first entry not yet sealed into a block.
    open_from: usize,
}

impl Shard {
    fn next_sequence(&self) -> u64 {
        self.entries.last().map_or(1, |e| e.sequence + 1)
    }

    fn head_hash(&self) -> ChainHash {
        self.head.clone().unwrap_or_else(ChainHash::zero)
    }
}

/// Append-only, verifiable history of every state transition.
pub struct Ledger {
    signer: LedgerSigner,
    store: Arc<dyn LedgerStore>,
    shards: RwLock<HashMap<Uuid, Arc<Mutex<Shard>>>>,
    block_size: usize,
}

impl Ledger {
    /// Default entries per sealed block.
    pub const DEFAULT_BLOCK_SIZE: usize = 64;

    pub fn new(signer: LedgerSigner, store: Arc<dyn LedgerStore>) -> Self {
        Self {
            signer,
            store,
            shards: RwLock::new(HashMap::new()),
            block_size: Self::DEFAULT_BLOCK_SIZE,
        }
    }

    /// Override the block sealing cadence.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Open a ledger over existing storage, rebuilding every shard.
    pub async fn open(signer: LedgerSigner, store: Arc<dyn LedgerStore>) -> Result<Self> {
        let ledger = Self::new(signer, store);
        let existing = ledger.store.load().await?;
        {
            let mut shards = ledger.shards.write().await;
            for entry in existing {
                let shard = shards
                    .entry(entry.tenant_id)
                    .or_insert_with(|| Arc::new(Mutex::new(Shard::default())));
                let mut shard = shard.try_lock().expect("exclusive during open");
                shard.head = Some(entry.entry_hash.clone());
                shard.entries.push(entry);
            }
        }
        ledger.reseal_all().await;
        Ok(ledger)
    }

    /// Append one transition to its tenant's chain.
    ///
    /// The entry is hashed, chained, signed, and persisted before the
    /// in-memory chain advances. A storage failure surfaces as
    /// `LedgerWriteFailure` and leaves the chain untouched — the caller
    /// must halt progress rather than drop the transition.
    pub async fn append(&self, draft: EntryDraft) -> Result<LedgerEntry> {
        let shard = self.shard(draft.tenant_id).await;
        let mut shard = shard.lock().await;

        let sequence = shard.next_sequence();
        let prev_hash = shard.head_hash();
        let payload_hash = hash_payload(&draft.payload);
        let canonical = LedgerEntry::canonical_string(
            sequence,
            draft.tenant_id,
            draft.workflow_id,
            draft.node_id,
            draft.attempt,
            draft.kind,
            &payload_hash,
            &prev_hash,
        );
        let entry_hash = hash_canonical(&canonical);
        let signature = self.signer.sign(entry_hash.0.as_bytes());

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            tenant_id: draft.tenant_id,
            sequence,
            timestamp: chrono::Utc::now(),
            workflow_id: draft.workflow_id,
            node_id: draft.node_id,
            attempt: draft.attempt,
            kind: draft.kind,
            payload: draft.payload,
            payload_hash,
            prev_hash,
            entry_hash: entry_hash.clone(),
            signature,
        };

        // Durability first; the chain only advances on an acknowledged write.
        self.store.append(&entry).await?;

        shard.head = Some(entry_hash);
        shard.entries.push(entry.clone());
        debug!(tenant = %entry.tenant_id, sequence, kind = ?entry.kind, "ledger append");

        if shard.entries.len() - shard.open_from >= self.block_size {
            Self::seal_open_block(&mut shard, self.block_size);
        }
        Ok(entry)
    }

    /// Entries for a tenant, optionally bounded to `[from, to]` (inclusive
    /// sequences).
    pub async fn entries(&self, tenant_id: Uuid, range: Option<(u64, u64)>) -> Vec<LedgerEntry> {
        let shard = self.shard(tenant_id).await;
        let shard = shard.lock().await;
        match range {
            Some((from, to)) => shard
                .entries
                .iter()
                .filter(|e| e.sequence >= from && e.sequence <= to)
                .cloned()
                .collect(),
            None => shard.entries.clone(),
        }
    }

    /// Entries documenting one workflow, in sequence order.
    pub async fn workflow_entries(&self, tenant_id: Uuid, workflow_id: Uuid) -> Vec<LedgerEntry> {
        let shard = self.shard(tenant_id).await;
        let shard = shard.lock().await;
        shard
            .entries
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    /// Sealed blocks for a tenant.
    pub async fn blocks(&self, tenant_id: Uuid) -> Vec<LedgerBlock> {
        let shard = self.shard(tenant_id).await;
        let shard = shard.lock().await;
        shard.blocks.clone()
    }

    /// Tenants with at least one entry.
    pub async fn tenants(&self) -> Vec<Uuid> {
        self.shards.read().await.keys().copied().collect()
    }

    /// Verify one tenant's chain, optionally bounded to a sequence range.
    pub async fn verify(&self, tenant_id: Uuid, range: Option<(u64, u64)>) -> ChainStatus {
        let shard = self.shard(tenant_id).await;
        let shard = shard.lock().await;
        verify_entries(&shard.entries, range)
    }

    /// Cross-tenant audit: verify every shard independently.
    ///
    /// This is the only global check; it makes no claim about ordering
    /// between shards.
    pub async fn verify_all(&self) -> Vec<(Uuid, ChainStatus)> {
        let tenants = self.tenants().await;
        let mut report = Vec::with_capacity(tenants.len());
        for tenant_id in tenants {
            report.push((tenant_id, self.verify(tenant_id, None).await));
        }
        report
    }

    async fn shard(&self, tenant_id: Uuid) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self.shards.read().await.get(&tenant_id) {
            return shard.clone();
        }
        let mut shards = self.shards.write().await;
        shards
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(Shard::default())))
            .clone()
    }

    async fn reseal_all(&self) {
        let shards = self.shards.read().await;
        for shard in shards.values() {
            let mut shard = shard.try_lock().expect("exclusive during open");
            while shard.entries.len() - shard.open_from >= self.block_size {
                Self::seal_open_block(&mut shard, self.block_size);
            }
        }
    }

    fn seal_open_block(shard: &mut Shard, block_size: usize) {
        let start = shard.open_from;
        let batch = &shard.entries[start..start + block_size];
        let prev_block_hash = shard
            .blocks
            .last()
            .map(|b| b.block_hash.clone())
            .unwrap_or_else(ChainHash::zero);
        let index = shard.blocks.len() as u64;
        let tenant_id = batch[0].tenant_id;
        let block = LedgerBlock::seal(tenant_id, index, batch, prev_block_hash);
        debug!(tenant = %tenant_id, index, "sealed ledger block");
        shard.blocks.push(block);
        shard.open_from += block_size;
    }
}

/// Verify an ordered slice of one tenant's entries.
///
/// Checks, per entry: payload hash, chain link to the predecessor, entry
/// hash, sequence continuity, and signature. Returns `Corrupted` at the
/// first break. Pure so that external holders of exported entries can run
/// the same audit.
pub fn verify_entries(entries: &[LedgerEntry], range: Option<(u64, u64)>) -> ChainStatus {
    let in_range = |seq: u64| range.map_or(true, |(from, to)| seq >= from && seq <= to);
    let mut checked = 0u64;

    for (i, entry) in entries.iter().enumerate() {
        if !in_range(entry.sequence) {
            continue;
        }
        checked += 1;

        if hash_payload(&entry.payload) != entry.payload_hash {
            return ChainStatus::Corrupted {
                sequence: entry.sequence,
                reason: "payload does not match payload_hash".into(),
            };
        }

        let expected_prev = if i == 0 {
            ChainHash::zero()
        } else {
            entries[i - 1].entry_hash.clone()
        };
        if entry.prev_hash != expected_prev {
            return ChainStatus::Corrupted {
                sequence: entry.sequence,
                reason: "broken chain link".into(),
            };
        }

        if i > 0 && entry.sequence != entries[i - 1].sequence + 1 {
            return ChainStatus::Corrupted {
                sequence: entry.sequence,
                reason: "sequence gap".into(),
            };
        }

        let recomputed = hash_canonical(&entry.own_canonical_string());
        if recomputed != entry.entry_hash {
            return ChainStatus::Corrupted {
                sequence: entry.sequence,
                reason: "entry hash mismatch".into(),
            };
        }

        if let Err(e) = verify_signature(&entry.signature, entry.entry_hash.0.as_bytes()) {
            return ChainStatus::Corrupted {
                sequence: entry.sequence,
                reason: e.to_string(),
            };
        }
    }

    ChainStatus::Valid { entries: checked }
}

//! # Conductor Ledger
//!
//! Append-only, hash-chained, Ed25519-signed record of every workflow and
//! node state transition. Chains are sharded per tenant; entries batch into
//! Merkle-rooted blocks. The ledger is the single source of truth for
//! audit, replay, and crash recovery.

pub mod block;
pub mod chain;
pub mod entry;
pub mod replay;
pub mod signer;
pub mod storage;

pub use block::{merkle_root, LedgerBlock};
pub use chain::{verify_entries, ChainStatus, Ledger};
pub use entry::{
    hash_canonical, hash_payload, ChainHash, EntryDraft, EntrySignature, LedgerEntry,
    LedgerEventKind,
};
pub use replay::{
    diff, replay_entries, simulate, Divergence, Hypothetical, ReplayedWorkflow, SimulatedTrace,
    TransitionRecord,
};
pub use signer::{verify_signature, LedgerSigner};
pub use storage::{FileLedgerStore, LedgerStore, MemoryLedgerStore};

//! Ledger entry types and hashing.
//!
//! Every state transition in the engine becomes one [`LedgerEntry`]. Entries
//! are hash-chained per tenant: each entry's `entry_hash` covers its payload
//! hash and the previous entry's hash, so any post-append mutation breaks
//! the chain at exactly that entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// SHA-256 digest rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainHash(pub String);

impl ChainHash {
    /// Chain origin: the all-zero hash a shard's first entry links to.
    pub fn zero() -> Self {
        Self("0".repeat(64))
    }

    /// 64 lowercase hex chars.
    pub fn is_wellformed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl std::fmt::Display for ChainHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of transition an entry documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    WorkflowSubmitted,
    WorkflowStateChanged,
    NodeStateChanged,
    CompensationExecuted,
    CompensationFailed,
    /// Committed node had no compensation; recorded as uncompensated.
    CompensationSkipped,
    PriorityEscalated,
    LoadShed,
    ReviewRequested,
    ReviewResolved,
    /// Free-form operator note appended through the API.
    Annotation,
}

impl LedgerEventKind {
    /// Stable label used in canonical strings.
    pub fn label(&self) -> &'static str {
        match self {
            LedgerEventKind::WorkflowSubmitted => "workflow_submitted",
            LedgerEventKind::WorkflowStateChanged => "workflow_state_changed",
            LedgerEventKind::NodeStateChanged => "node_state_changed",
            LedgerEventKind::CompensationExecuted => "compensation_executed",
            LedgerEventKind::CompensationFailed => "compensation_failed",
            LedgerEventKind::CompensationSkipped => "compensation_skipped",
            LedgerEventKind::PriorityEscalated => "priority_escalated",
            LedgerEventKind::LoadShed => "load_shed",
            LedgerEventKind::ReviewRequested => "review_requested",
            LedgerEventKind::ReviewResolved => "review_resolved",
            LedgerEventKind::Annotation => "annotation",
        }
    }
}

/// Cryptographic signature over an entry hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySignature {
    /// The algorithm used (always "ed25519" today).
    pub algorithm: String,

    /// The signer's public key (hex-encoded).
    pub public_key: String,

    /// The signature bytes (hex-encoded).
    pub signature: String,
}

/// An unsigned, unsequenced entry handed to [`Ledger::append`].
///
/// [`Ledger::append`]: crate::chain::Ledger::append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDraft {
    pub tenant_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: Option<Uuid>,
    pub attempt: Option<u32>,
    pub kind: LedgerEventKind,
    pub payload: serde_json::Value,
}

impl EntryDraft {
    /// Workflow-scoped draft with no node reference.
    pub fn workflow(
        tenant_id: Uuid,
        workflow_id: Uuid,
        kind: LedgerEventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            workflow_id,
            node_id: None,
            attempt: None,
            kind,
            payload,
        }
    }

    /// Node-scoped draft.
    pub fn node(
        tenant_id: Uuid,
        workflow_id: Uuid,
        node_id: Uuid,
        attempt: Option<u32>,
        kind: LedgerEventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            workflow_id,
            node_id: Some(node_id),
            attempt,
            kind,
            payload,
        }
    }
}

/// An immutable, signed, chained ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Monotonic per tenant, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: Uuid,
    pub node_id: Option<Uuid>,
    pub attempt: Option<u32>,
    pub kind: LedgerEventKind,
    pub payload: serde_json::Value,
    /// SHA-256 of the serialized payload.
    pub payload_hash: ChainHash,
    /// `entry_hash` of the preceding entry in this tenant's chain.
    pub prev_hash: ChainHash,
    /// Hash of this entry's canonical string; the next entry links to it.
    pub entry_hash: ChainHash,
    pub signature: EntrySignature,
}

impl LedgerEntry {
    /// The string that is hashed into `entry_hash`.
    ///
    /// Format:
    /// `{seq}:{tenant}:{workflow}:{node|-}:{attempt|-}:{kind}:{payload_hash}:{prev_hash}`
    pub fn canonical_string(
        sequence: u64,
        tenant_id: Uuid,
        workflow_id: Uuid,
        node_id: Option<Uuid>,
        attempt: Option<u32>,
        kind: LedgerEventKind,
        payload_hash: &ChainHash,
        prev_hash: &ChainHash,
    ) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}",
            sequence,
            tenant_id,
            workflow_id,
            node_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            attempt.map_or_else(|| "-".to_string(), |a| a.to_string()),
            kind.label(),
            payload_hash,
            prev_hash,
        )
    }

    /// Recompute this entry's canonical string from its own fields.
    pub fn own_canonical_string(&self) -> String {
        Self::canonical_string(
            self.sequence,
            self.tenant_id,
            self.workflow_id,
            self.node_id,
            self.attempt,
            self.kind,
            &self.payload_hash,
            &self.prev_hash,
        )
    }
}

/// SHA-256 of a JSON payload, as a [`ChainHash`].
pub fn hash_payload(payload: &serde_json::Value) -> ChainHash {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    ChainHash(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of a canonical string, as a [`ChainHash`].
pub fn hash_canonical(canonical: &str) -> ChainHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    ChainHash(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_hash_is_wellformed() {
        assert!(ChainHash::zero().is_wellformed());
    }

    #[test]
    fn test_malformed_hash_detected() {
        assert!(!ChainHash("xyz".into()).is_wellformed());
        assert!(!ChainHash("0".repeat(63)).is_wellformed());
    }

    #[test]
    fn test_payload_hash_is_deterministic() {
        let payload = serde_json::json!({"to": "committed"});
        assert_eq!(hash_payload(&payload), hash_payload(&payload));
    }

    #[test]
    fn test_different_payloads_hash_differently() {
        let a = hash_payload(&serde_json::json!({"to": "committed"}));
        let b = hash_payload(&serde_json::json!({"to": "failed"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonical_string_shape() {
        let payload_hash = ChainHash("a".repeat(64));
        let prev = ChainHash::zero();
        let s = LedgerEntry::canonical_string(
            7,
            Uuid::nil(),
            Uuid::nil(),
            None,
            None,
            LedgerEventKind::NodeStateChanged,
            &payload_hash,
            &prev,
        );
        assert!(s.starts_with("7:"));
        assert!(s.contains(":node_state_changed:"));
        assert!(s.contains(":-:-:"));
    }
}

//! Pluggable ledger persistence.
//!
//! The chain state lives in memory; every accepted entry is written through
//! to a [`LedgerStore`] before the chain advances. The JSONL file store
//! preserves append order on disk and can be re-verified by any process
//! holding the file.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use conductor_core::{ConductorError, Result};

use crate::entry::LedgerEntry;

/// Durable, append-only entry storage.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist one entry. A failure here must abort the append: the caller
    /// treats it as `LedgerWriteFailure` and halts workflow progress.
    async fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// Load every persisted entry in original append order.
    async fn load(&self) -> Result<Vec<LedgerEntry>>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.entries.read().await.clone())
    }
}

/// Append-only JSONL file store. One entry per line, append order preserved.
pub struct FileLedgerStore {
    path: PathBuf,
    /// Serializes writers so concurrent appends cannot interleave lines.
    write_lock: Mutex<()>,
}

impl FileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ConductorError::LedgerWriteFailure {
                message: format!("open {}: {e}", self.path.display()),
            })?;
        file.write_all(&line)
            .await
            .map_err(|e| ConductorError::LedgerWriteFailure {
                message: format!("write {}: {e}", self.path.display()),
            })?;
        file.flush()
            .await
            .map_err(|e| ConductorError::LedgerWriteFailure {
                message: format!("flush {}: {e}", self.path.display()),
            })?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<LedgerEntry>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ConductorError::LedgerWriteFailure {
                    message: format!("read {}: {e}", self.path.display()),
                })
            }
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| ConductorError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{hash_payload, ChainHash, EntrySignature, LedgerEventKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn make_entry(sequence: u64) -> LedgerEntry {
        let payload = serde_json::json!({"to": "committed"});
        LedgerEntry {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            workflow_id: Uuid::new_v4(),
            node_id: None,
            attempt: None,
            kind: LedgerEventKind::WorkflowStateChanged,
            payload_hash: hash_payload(&payload),
            payload,
            prev_hash: ChainHash::zero(),
            entry_hash: ChainHash("a".repeat(64)),
            signature: EntrySignature {
                algorithm: "ed25519".into(),
                public_key: "00".repeat(32),
                signature: "00".repeat(64),
            },
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryLedgerStore::new();
        store.append(&make_entry(1)).await.unwrap();
        store.append(&make_entry(2)).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let path = std::env::temp_dir().join(format!("conductor-ledger-{}.jsonl", Uuid::new_v4()));
        let store = FileLedgerStore::new(&path);
        store.append(&make_entry(1)).await.unwrap();
        store.append(&make_entry(2)).await.unwrap();

        // A second store over the same file sees both entries in order.
        let reopened = FileLedgerStore::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].sequence, 2);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_file_store_load_missing_is_empty() {
        let path = std::env::temp_dir().join(format!("conductor-absent-{}.jsonl", Uuid::new_v4()));
        let store = FileLedgerStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
    }
}

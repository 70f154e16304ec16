//! Quarantine persistence.
//!
//! One JSON object keyed by node id, written after every quarantine/recovery
//! mutation. Writes are best-effort: a failed save is logged and swallowed so
//! it can never fail a live request. Loaded once at startup and filtered
//! against the currently-known node set by the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gateway_types::{GatewayResult, QuarantineRecord};

#[derive(Debug, Clone)]
pub struct QuarantineStore {
    path: PathBuf,
    /// Snapshot sequence; assigned at `save_detached` call time, so call
    /// order defines recency.
    seq: Arc<AtomicU64>,
    /// Sequence of the newest snapshot that reached disk.
    landed: Arc<tokio::sync::Mutex<u64>>,
}

impl QuarantineStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            seq: Arc::new(AtomicU64::new(0)),
            landed: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    /// Load persisted records. A missing file is an empty map, not an error.
    pub async fn load(&self) -> GatewayResult<HashMap<String, QuarantineRecord>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let records = serde_json::from_str(&content)?;
        Ok(records)
    }

    /// Atomically replace the file (write temp, rename).
    pub async fn save(&self, records: &HashMap<String, QuarantineRecord>) -> GatewayResult<()> {
        let content = serde_json::to_string_pretty(records)?;
        let temp_path = self.path.with_extension("json.tmp");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Save in a detached task, logging failure instead of propagating it.
    ///
    /// Tasks are sequence-guarded: a snapshot is dropped if a later one has
    /// already reached disk, so the file stays monotonic even when spawned
    /// tasks complete out of order. The registry calls this while its state
    /// lock is held, which makes call order the snapshot order.
    pub fn save_detached(&self, records: HashMap<String, QuarantineRecord>) {
        let store = self.clone();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(async move {
            let mut landed = store.landed.lock().await;
            if seq <= *landed {
                return;
            }
            match store.save(&records).await {
                Ok(()) => *landed = seq,
                Err(e) => {
                    tracing::warn!(path = %store.path.display(), error = %e, "Failed to persist quarantine state");
                },
            }
        });
    }
}

//! Store-wide counters persisted at `<root>/config`
//!
//! `lastId` is the only source of new IDs and never goes backwards, so IDs
//! are not reused after removal. `count` tracks live records.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Catalog filename at the store root
pub const CATALOG_FILENAME: &str = "config";

/// On-disk form of the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    #[serde(default, alias = "index")]
    pub last_id: u64,
    #[serde(default)]
    pub count: u64,
}

pub struct Catalog {
    path: PathBuf,
    last_id: AtomicU64,
    count: AtomicU64,
    /// Serializes writers so the newest snapshot is written last
    persist_lock: Mutex<()>,
}

impl Catalog {
    /// Load the catalog from `root`, starting at zero when no file exists
    pub async fn load<P: AsRef<Path>>(root: P) -> Result<Self> {
        let path = root.as_ref().join(CATALOG_FILENAME);

        let snapshot = match fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => CatalogSnapshot::default(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                StorageError::Config(format!("unreadable catalog {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            last_id = snapshot.last_id,
            count = snapshot.count,
            "Loaded catalog"
        );

        Ok(Self {
            path,
            last_id: AtomicU64::new(snapshot.last_id),
            count: AtomicU64::new(snapshot.count),
            persist_lock: Mutex::new(()),
        })
    }

    /// Reserve the next ID and count it as live. Never suspends.
    pub fn allocate(&self) -> u64 {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one record from the live count
    pub fn release(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            last_id: self.last_id.load(Ordering::SeqCst),
            count: self.count.load(Ordering::SeqCst),
        }
    }

    pub fn last_id(&self) -> u64 {
        self.last_id.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Write the current counters to disk
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        fs::write(&self.path, serde_json::to_vec(&snapshot)?).await?;
        debug!(last_id = snapshot.last_id, count = snapshot.count, "Persisted catalog");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

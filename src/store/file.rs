//! JSON file store for the usage ledger.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::UsageStore;
use crate::error::{Result, TollgateError};
use crate::quota::UsageRecord;

/// Stores the ledger as a JSON array of records at a fixed path.
///
/// Saves write to a sibling temp file and rename it into place, so a
/// crash mid-save leaves the previous snapshot intact. Concurrent saves
/// (a background persist racing the compaction sweep) are serialized on
/// an internal lock; the last writer wins.
pub struct FileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Create a store backed by the given file path. The file need not
    /// exist yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The path this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UsageStore for FileStore {
    async fn load(&self) -> Result<Vec<UsageRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            // First run: nothing persisted yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TollgateError::Storage(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let records: Vec<UsageRecord> = serde_json::from_str(&contents).map_err(|e| {
            TollgateError::Storage(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), count = records.len(), "Read usage ledger");
        Ok(records)
    }

    async fn save(&self, records: &[UsageRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| TollgateError::Storage(format!("failed to serialize ledger: {}", e)))?;

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = records.len(), "Wrote usage ledger");
        Ok(())
    }
}

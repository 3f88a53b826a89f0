//! Persistent cache index
//!
//! The index maps cache keys (hex) to entry metadata and lives as one JSON
//! document next to the object store. It is always rewritten atomically:
//! write to a temporary name, then rename over the old index.

use crate::entry::CacheEntry;
use provd_errors::{CacheError, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct CacheIndex {
    pub entries: HashMap<String, CacheEntry>,
}

impl CacheIndex {
    /// Load the index from disk, or an empty index if absent
    pub(crate) async fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::IoError {
                message: format!("failed to read cache index: {e}"),
            })?;

        serde_json::from_str(&content).map_err(|e| {
            CacheError::IndexCorrupted {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Persist the index atomically
    pub(crate) async fn persist(&self, path: &Path) -> Result<(), Error> {
        let parent = path.parent().ok_or_else(|| CacheError::IoError {
            message: "cache index has no parent directory".to_string(),
        })?;

        let temp_path = parent.join(format!("index.{}.tmp", Uuid::new_v4()));
        let content = serde_json::to_vec_pretty(self)?;

        if let Err(e) = fs::write(&temp_path, &content).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::IoError {
                message: format!("failed to write cache index: {e}"),
            }
            .into());
        }

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| CacheError::IoError {
                message: format!("failed to replace cache index: {e}"),
            })?;

        Ok(())
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

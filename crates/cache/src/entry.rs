//! Cache entry metadata

use chrono::{DateTime, Utc};
use provd_hash::Hash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for one cached image
///
/// Entries are managed exclusively by the [`CacheManager`](crate::CacheManager);
/// callers only ever see immutable snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Stable key derived from the image's source locator
    pub key: Hash,
    /// Path of the cached file inside the object store
    pub path: PathBuf,
    /// BLAKE3 hash of the cached content
    pub content_hash: Hash,
    /// File size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    /// Age of the entry since creation
    ///
    /// Negative when `created_at` lies in the future (clock skew); callers
    /// treat that as not expired.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

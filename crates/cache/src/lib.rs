#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Content-addressed image cache for provd
//!
//! Downloaded OS images are stored under a key derived from their source
//! locator. Partial writes are never addressable: content lands under a
//! temporary name and is renamed into place only after its hash is known
//! good. Entries in use by an active request hold a lease and are skipped
//! by eviction.

mod entry;
mod index;

pub use entry::CacheEntry;

use chrono::Utc;
use dashmap::DashMap;
use index::CacheIndex;
use provd_errors::{CacheError, Error};
use provd_hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Statistics returned by an eviction pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub evicted_by_age: usize,
    pub evicted_by_size: usize,
    pub bytes_freed: u64,
}

/// RAII lease preventing eviction of an entry while a request uses it
#[derive(Debug)]
pub struct CacheLease {
    key: String,
    counts: Arc<DashMap<String, usize>>,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if let Some(mut count) = self.counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.counts.remove_if(&self.key, |_, v| *v == 0);
            }
        }
    }
}

/// Content-addressed cache of OS images
#[derive(Debug, Clone)]
pub struct CacheManager {
    objects_dir: PathBuf,
    index_path: PathBuf,
    /// Serializes all metadata read-modify-write operations
    index: Arc<Mutex<CacheIndex>>,
    /// Per-key lease reference counts
    leases: Arc<DashMap<String, usize>>,
    verify_on_lookup: bool,
}

impl CacheManager {
    /// Open (or initialize) a cache rooted at `base_dir`
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the index is
    /// unreadable.
    pub async fn open(base_dir: &Path, verify_on_lookup: bool) -> Result<Self, Error> {
        let objects_dir = base_dir.join("objects");
        fs::create_dir_all(&objects_dir)
            .await
            .map_err(|e| CacheError::IoError {
                message: format!("failed to create cache directory: {e}"),
            })?;

        let index_path = base_dir.join("index.json");
        let index = CacheIndex::load(&index_path).await?;

        Ok(Self {
            objects_dir,
            index_path,
            index: Arc::new(Mutex::new(index)),
            leases: Arc::new(DashMap::new()),
            verify_on_lookup,
        })
    }

    /// Look up a cache entry by key
    ///
    /// A hit updates the entry's access metadata and returns a snapshot plus
    /// a lease that shields the entry from eviction. A missing or corrupt
    /// file is treated as a miss: the stale entry is dropped so the caller
    /// re-fetches.
    ///
    /// # Errors
    /// Returns an error only for index persistence failures; integrity
    /// problems surface as a miss.
    pub async fn lookup(&self, key: &Hash) -> Result<Option<(CacheEntry, CacheLease)>, Error> {
        let hex = key.to_hex();
        let mut index = self.index.lock().await;

        let Some(entry) = index.entries.get(&hex).cloned() else {
            return Ok(None);
        };

        if !entry.path.exists() {
            warn!(key = %hex, path = %entry.path.display(), "cached file missing, dropping entry");
            index.entries.remove(&hex);
            index.persist(&self.index_path).await?;
            return Ok(None);
        }

        if self.verify_on_lookup {
            let actual = Hash::hash_file(&entry.path).await?;
            if actual != entry.content_hash {
                warn!(
                    key = %hex,
                    expected = %entry.content_hash,
                    actual = %actual,
                    "cached content corrupted, dropping entry"
                );
                index.entries.remove(&hex);
                index.persist(&self.index_path).await?;
                let _ = fs::remove_file(&entry.path).await;
                return Ok(None);
            }
        }

        let updated = {
            let stored = index
                .entries
                .get_mut(&hex)
                .ok_or_else(|| CacheError::EntryNotFound { key: hex.clone() })?;
            stored.last_access = Utc::now();
            stored.access_count += 1;
            stored.clone()
        };
        index.persist(&self.index_path).await?;

        Ok(Some((updated, self.lease(&hex))))
    }

    /// Store a file into the cache under `key`
    ///
    /// The content is hashed while being copied to a temporary name; only
    /// after an (optional) expected-hash check does it get renamed into the
    /// object store and registered in the index.
    ///
    /// # Errors
    /// Returns [`CacheError::HashMismatch`] if `expected_hash` is supplied
    /// and does not match, or an I/O error; in both cases nothing is
    /// registered under the key.
    pub async fn store(
        &self,
        key: &Hash,
        source_path: &Path,
        expected_hash: Option<&Hash>,
    ) -> Result<(CacheEntry, CacheLease), Error> {
        let hex = key.to_hex();
        let dest_path = self.objects_dir.join(&hex);
        let temp_path = self.objects_dir.join(format!("{}.tmp", Uuid::new_v4()));

        let source = fs::File::open(source_path)
            .await
            .map_err(|e| Error::io_with_path(&e, source_path))?;
        let dest = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::io_with_path(&e, &temp_path))?;

        let copied = Hash::hash_and_copy(source, dest).await;
        let (content_hash, size) = match copied {
            Ok(result) => result,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_hash {
            if content_hash != *expected {
                let _ = fs::remove_file(&temp_path).await;
                return Err(CacheError::HashMismatch {
                    expected: expected.to_hex(),
                    actual: content_hash.to_hex(),
                }
                .into());
            }
        }

        if let Err(e) = fs::rename(&temp_path, &dest_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::IoError {
                message: format!("failed to move file into cache: {e}"),
            }
            .into());
        }

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            path: dest_path,
            content_hash,
            size,
            created_at: now,
            last_access: now,
            access_count: 1,
        };

        let mut index = self.index.lock().await;
        index.entries.insert(hex.clone(), entry.clone());
        index.persist(&self.index_path).await?;
        debug!(key = %hex, size, "stored image in cache");

        Ok((entry, self.lease(&hex)))
    }

    /// Evict entries to satisfy age and size bounds
    ///
    /// Entries older than `max_age` go first; if the aggregate size still
    /// exceeds `max_total_bytes`, least-recently-accessed entries follow
    /// until the cache complies. Leased entries are never evicted.
    ///
    /// # Errors
    /// Returns an error if the index cannot be persisted.
    pub async fn evict(
        &self,
        max_total_bytes: u64,
        max_age: Duration,
    ) -> Result<EvictionStats, Error> {
        let now = Utc::now();
        let mut stats = EvictionStats::default();
        let mut index = self.index.lock().await;

        // Age pass, at full timestamp precision so a zero max_age expires
        // everything unleased
        let expired: Vec<String> = index
            .entries
            .iter()
            .filter(|(hex, entry)| {
                entry.age(now).to_std().is_ok_and(|age| age >= max_age) && !self.is_leased(hex)
            })
            .map(|(hex, _)| hex.clone())
            .collect();

        for hex in expired {
            if let Some(entry) = index.entries.remove(&hex) {
                let _ = fs::remove_file(&entry.path).await;
                stats.evicted_by_age += 1;
                stats.bytes_freed += entry.size;
            }
        }

        // LRU pass
        if index.total_bytes() > max_total_bytes {
            let mut by_access: Vec<(String, u64, chrono::DateTime<Utc>)> = index
                .entries
                .iter()
                .filter(|(hex, _)| !self.is_leased(hex))
                .map(|(hex, entry)| (hex.clone(), entry.size, entry.last_access))
                .collect();
            by_access.sort_by_key(|(_, _, last_access)| *last_access);

            for (hex, _, _) in by_access {
                if index.total_bytes() <= max_total_bytes {
                    break;
                }
                if let Some(entry) = index.entries.remove(&hex) {
                    let _ = fs::remove_file(&entry.path).await;
                    stats.evicted_by_size += 1;
                    stats.bytes_freed += entry.size;
                }
            }
        }

        if stats.evicted_by_age > 0 || stats.evicted_by_size > 0 {
            index.persist(&self.index_path).await?;
            debug!(
                by_age = stats.evicted_by_age,
                by_size = stats.evicted_by_size,
                bytes_freed = stats.bytes_freed,
                "cache eviction pass complete"
            );
        }

        Ok(stats)
    }

    /// Number of entries currently in the cache
    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Aggregate size of all cached content in bytes
    pub async fn total_bytes(&self) -> u64 {
        self.index.lock().await.total_bytes()
    }

    fn lease(&self, hex: &str) -> CacheLease {
        *self.leases.entry(hex.to_string()).or_insert(0) += 1;
        CacheLease {
            key: hex.to_string(),
            counts: Arc::clone(&self.leases),
        }
    }

    fn is_leased(&self, hex: &str) -> bool {
        self.leases.get(hex).is_some_and(|count| *count > 0)
    }
}

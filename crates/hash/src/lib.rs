#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! BLAKE3 content addressing for provd
//!
//! Two jobs: derive stable cache keys from image source locators, and
//! verify the integrity of image bytes as they move through the cache
//! and the stage executors. Hashes serialize as lowercase hex strings.

use provd_errors::{CacheError, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read quantum for streaming hash computation
const READ_BUF: usize = 64 * 1024;

/// A BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hash(blake3::Hash);

impl Hash {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from(bytes))
    }

    /// Hash a byte slice in one shot
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Parse a 64-character lowercase or uppercase hex digest
    ///
    /// # Errors
    /// Returns an error when the input is not exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let parsed = blake3::Hash::from_hex(s).map_err(|e| CacheError::IndexCorrupted {
            message: format!("bad hash string: {e}"),
        })?;
        Ok(Self(parsed))
    }

    /// Hash the full contents of a file
    ///
    /// # Errors
    /// Returns [`CacheError::FileMissing`] if the file cannot be opened,
    /// or an I/O error if reading fails part way.
    pub async fn hash_file(path: &Path) -> Result<Self, Error> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|_| CacheError::FileMissing {
                path: path.display().to_string(),
            })?;
        let (hash, _) = Self::hash_and_copy(file, tokio::io::sink()).await?;
        Ok(hash)
    }

    /// Copy reader to writer, hashing the bytes on the way through
    ///
    /// Returns the digest and the number of bytes copied. The writer is
    /// flushed before returning.
    ///
    /// # Errors
    /// Returns an error if the reader or the writer fails.
    pub async fn hash_and_copy<R, W>(mut reader: R, mut writer: W) -> Result<(Self, u64), Error>
    where
        R: AsyncReadExt + Unpin,
        W: AsyncWriteExt + Unpin,
    {
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; READ_BUF];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            writer.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
        writer.flush().await?;
        Ok((Self(hasher.finalize()), copied))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.0.as_bytes());
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The cache key for an image source locator
///
/// Hashing the locator string means the same URL or local path always
/// addresses the same cache entry, with no parsing or normalization.
#[must_use]
pub fn cache_key(locator: &str) -> Hash {
    Hash::from_data(locator.as_bytes())
}

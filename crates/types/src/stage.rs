//! Pipeline stage identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// One discrete unit of the provisioning pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    CacheLookup,
    Download,
    Decompress,
    ChecksumVerify,
    DeviceFormat,
    ImageWrite,
    PostInstallConfigure,
}

impl StageKind {
    /// Stable identifier used in wire records and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheLookup => "cache-lookup",
            Self::Download => "download",
            Self::Decompress => "decompress",
            Self::ChecksumVerify => "checksum-verify",
            Self::DeviceFormat => "device-format",
            Self::ImageWrite => "image-write",
            Self::PostInstallConfigure => "post-install-configure",
        }
    }

    /// Whether this stage runs as a supervised child process
    ///
    /// Cache lookup is the only in-process stage; everything else is an
    /// external stage executor.
    #[must_use]
    pub fn is_external(self) -> bool {
        !matches!(self, Self::CacheLookup)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

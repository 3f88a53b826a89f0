//! Provisioning request model
//!
//! The raw wire document is validated into a [`ProvisioningRequest`] before
//! it enters the pipeline; malformed input never gets past the dispatcher.

use provd_errors::{Error, InputError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// First-boot configuration document, consumed verbatim by the
/// post-install-configure stage.
///
/// Keys are ordered so the rendered `key=value` output is deterministic.
pub type ConfigDocument = BTreeMap<String, String>;

/// Where the OS image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// A previously cached image, addressed by its cache key
    CacheKey(String),
    /// A remote image to download (and cache)
    DownloadUrl(String),
    /// A pre-resolved local file path, used as-is
    LocalPath(PathBuf),
}

impl ImageSource {
    /// The locator string a cache key is derived from
    #[must_use]
    pub fn locator(&self) -> String {
        match self {
            Self::CacheKey(key) => key.clone(),
            Self::DownloadUrl(url) => url.clone(),
            Self::LocalPath(path) => path.display().to_string(),
        }
    }
}

/// The request document exactly as it arrives on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProvisioningRequest {
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_image_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigDocument>,
    #[serde(default)]
    pub stream: bool,
}

/// Validated, immutable input for one pipeline run
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    /// Correlation id assigned at admission
    pub request_id: Uuid,
    /// Target device identifier (e.g. `/dev/sdb`)
    pub device_id: String,
    /// Image source (exactly one)
    pub source: ImageSource,
    /// Optional first-boot configuration
    pub configuration: Option<ConfigDocument>,
    /// Whether the caller asked for a streamed progress channel
    pub stream: bool,
}

impl ProvisioningRequest {
    /// Validate a raw wire document into a pipeline request
    ///
    /// # Errors
    /// Returns an [`InputError`] if the device id is missing or the image
    /// source is absent or ambiguous.
    pub fn validate(raw: RawProvisioningRequest) -> Result<Self, Error> {
        let device_id = match raw.device_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(InputError::MissingField {
                    field: "device_id".to_string(),
                }
                .into())
            }
        };
        // Device identifiers are passed to stage executors on argv; embedded
        // whitespace or control characters never name a real block device
        if device_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(InputError::InvalidDevice { device: device_id }.into());
        }

        let mut sources = Vec::new();
        if let Some(key) = raw.cache_key {
            sources.push(ImageSource::CacheKey(key));
        }
        if let Some(url) = raw.download_url {
            sources.push(ImageSource::DownloadUrl(url));
        }
        if let Some(path) = raw.local_image_path {
            sources.push(ImageSource::LocalPath(path));
        }

        let source = match sources.len() {
            0 => return Err(InputError::MissingImageSource.into()),
            1 => sources.remove(0),
            _ => return Err(InputError::ConflictingImageSources.into()),
        };

        Ok(Self {
            request_id: Uuid::new_v4(),
            device_id,
            source,
            configuration: raw.configuration,
            stream: raw.stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_url() -> RawProvisioningRequest {
        RawProvisioningRequest {
            device_id: Some("/dev/sdb".to_string()),
            download_url: Some("https://example.test/os.img.gz".to_string()),
            ..RawProvisioningRequest::default()
        }
    }

    #[test]
    fn validate_accepts_single_source() {
        let req = ProvisioningRequest::validate(raw_with_url()).unwrap();
        assert_eq!(req.device_id, "/dev/sdb");
        assert!(matches!(req.source, ImageSource::DownloadUrl(_)));
        assert!(!req.stream);
    }

    #[test]
    fn validate_rejects_missing_device_id() {
        let mut raw = raw_with_url();
        raw.device_id = None;
        let err = ProvisioningRequest::validate(raw).unwrap_err();
        assert!(matches!(
            err,
            Error::Input(InputError::MissingField { .. })
        ));
    }

    #[test]
    fn validate_rejects_blank_device_id() {
        let mut raw = raw_with_url();
        raw.device_id = Some("   ".to_string());
        assert!(ProvisioningRequest::validate(raw).is_err());
    }

    #[test]
    fn validate_rejects_device_id_with_whitespace() {
        let mut raw = raw_with_url();
        raw.device_id = Some("/dev/sd b".to_string());
        let err = ProvisioningRequest::validate(raw).unwrap_err();
        assert!(matches!(err, Error::Input(InputError::InvalidDevice { .. })));
    }

    #[test]
    fn validate_rejects_no_source() {
        let raw = RawProvisioningRequest {
            device_id: Some("/dev/sdb".to_string()),
            ..RawProvisioningRequest::default()
        };
        let err = ProvisioningRequest::validate(raw).unwrap_err();
        assert!(matches!(err, Error::Input(InputError::MissingImageSource)));
    }

    #[test]
    fn validate_rejects_conflicting_sources() {
        let mut raw = raw_with_url();
        raw.local_image_path = Some(PathBuf::from("/tmp/os.img"));
        let err = ProvisioningRequest::validate(raw).unwrap_err();
        assert!(matches!(
            err,
            Error::Input(InputError::ConflictingImageSources)
        ));
    }

    #[test]
    fn raw_request_parses_wire_document() {
        let json = r#"{
            "device_id": "/dev/mmcblk0",
            "download_url": "https://example.test/os.img.gz",
            "configuration": {"hostname": "node-1"},
            "stream": true
        }"#;
        let raw: RawProvisioningRequest = serde_json::from_str(json).unwrap();
        let req = ProvisioningRequest::validate(raw).unwrap();
        assert!(req.stream);
        assert_eq!(
            req.configuration.unwrap().get("hostname").unwrap(),
            "node-1"
        );
    }
}

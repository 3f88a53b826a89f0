#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration management for provd
//!
//! This crate handles loading and merging configuration from:
//! - Default values (hard-coded)
//! - Configuration file (/etc/provd/config.toml)
//! - Environment variables
//! - CLI flags

use provd_errors::{ConfigError, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/provd/config.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub stages: StagesConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Bound on the graceful-shutdown wait for in-flight requests
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// Image cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    /// Re-hash cached content on every lookup; a mismatch is a miss
    #[serde(default = "default_verify_on_lookup")]
    pub verify_on_lookup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            max_total_bytes: default_max_total_bytes(),
            max_age_days: default_max_age_days(),
            verify_on_lookup: default_verify_on_lookup(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_window_seconds(),
            max_requests_per_window: default_max_requests(),
        }
    }
}

/// Supervision timeout configuration (all in seconds unless noted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Silence timeout is suppressed while an executor initializes
    #[serde(default = "default_startup_grace")]
    pub startup_grace_seconds: u64,
    /// No-output timeout for installation-class stages (download, write)
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_seconds: u64,
    /// Overall bound for quick stages (format, verify, configure)
    #[serde(default = "default_quick_stage_timeout")]
    pub quick_stage_timeout_seconds: u64,
    /// Grace between SIGTERM and SIGKILL
    #[serde(default = "default_termination_grace")]
    pub termination_grace_seconds: u64,
    /// How often blocked waits re-check shutdown and stall conditions
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            startup_grace_seconds: default_startup_grace(),
            silence_timeout_seconds: default_silence_timeout(),
            quick_stage_timeout_seconds: default_quick_stage_timeout(),
            termination_grace_seconds: default_termination_grace(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TimeoutsConfig {
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_seconds)
    }

    #[must_use]
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs(self.silence_timeout_seconds)
    }

    #[must_use]
    pub fn quick_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.quick_stage_timeout_seconds)
    }

    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Per-stage executor override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOverride {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Stage executor configuration
///
/// By default every stage re-invokes the provd binary (`provd stage <kind>`);
/// an override replaces the program for that stage, which is also how tests
/// substitute scripted executors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StagesConfig {
    /// Keyed by stage identifier (`download`, `device-format`, ...)
    #[serde(default)]
    pub overrides: HashMap<String, StageOverride>,
}

impl Config {
    /// Load configuration from a file, or defaults if the file is absent
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, Error> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::ReadFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Merge environment variables (highest precedence below CLI flags)
    ///
    /// # Errors
    /// Returns an error if a numeric variable fails to parse.
    pub fn merge_env(&mut self) -> Result<(), Error> {
        if let Ok(listen) = std::env::var("PROVD_LISTEN") {
            self.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("PROVD_CACHE_DIR") {
            self.cache.directory = PathBuf::from(dir);
        }
        if let Ok(bytes) = std::env::var("PROVD_CACHE_MAX_BYTES") {
            self.cache.max_total_bytes =
                bytes.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "PROVD_CACHE_MAX_BYTES".to_string(),
                    message: format!("not a number: {bytes}"),
                })?;
        }
        if let Ok(secs) = std::env::var("PROVD_SILENCE_TIMEOUT") {
            self.timeouts.silence_timeout_seconds =
                secs.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "PROVD_SILENCE_TIMEOUT".to_string(),
                    message: format!("not a number: {secs}"),
                })?;
        }
        Ok(())
    }
}

// Default value functions for serde

fn default_listen() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/provd")
}

fn default_max_total_bytes() -> u64 {
    20 * 1024 * 1024 * 1024 // 20 GiB
}

fn default_max_age_days() -> u32 {
    30
}

fn default_verify_on_lookup() -> bool {
    true
}

fn default_window_seconds() -> u64 {
    60
}

fn default_max_requests() -> usize {
    100
}

fn default_startup_grace() -> u64 {
    120
}

fn default_silence_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_quick_stage_timeout() -> u64 {
    300 // 5 minutes
}

fn default_termination_grace() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let config = Config::load_or_default(Some(Path::new("/nonexistent/provd.toml")))
            .await
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8700");
        assert_eq!(config.limits.max_requests_per_window, 100);
        assert_eq!(config.timeouts.startup_grace_seconds, 120);
    }

    #[tokio::test]
    async fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nlisten = \"0.0.0.0:9000\"\n\n[cache]\nmax_age_days = 7"
        )
        .unwrap();

        let config = Config::load_or_default(Some(file.path())).await.unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.cache.max_age_days, 7);
        // Untouched sections keep defaults
        assert_eq!(config.timeouts.silence_timeout_seconds, 1800);
    }

    #[tokio::test]
    async fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[").unwrap();
        assert!(Config::load_or_default(Some(file.path())).await.is_err());
    }

    #[tokio::test]
    async fn stage_overrides_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[stages.overrides.download]\nprogram = \"/usr/local/bin/fetch\"\nargs = [\"--quiet\"]"
        )
        .unwrap();

        let config = Config::load_or_default(Some(file.path())).await.unwrap();
        let over = config.stages.overrides.get("download").unwrap();
        assert_eq!(over.program, PathBuf::from("/usr/local/bin/fetch"));
        assert_eq!(over.args, vec!["--quiet".to_string()]);
    }
}

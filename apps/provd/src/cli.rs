//! Command line interface definition

use clap::{Parser, Subcommand};
use provd_hash::Hash;
use std::path::PathBuf;

/// provd - device image provisioning daemon
#[derive(Parser)]
#[command(name = "provd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Device image provisioning daemon for single-board computers")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Global arguments available for all commands
#[derive(Parser)]
pub struct GlobalArgs {
    /// Emit logs as JSON records
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Use alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the provisioning server
    Serve {
        /// Listen address (host:port)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Image cache directory
        #[arg(long, value_name = "DIR")]
        cache_dir: Option<PathBuf>,
    },

    /// Run one stage executor (spawned by the daemon, not for direct use)
    #[command(subcommand, hide = true)]
    Stage(StageCommands),
}

/// Stage executor invocations
///
/// Subcommand names match the stage identifiers the daemon passes to
/// [`std::process::Command`], so the default executor for every stage is
/// this binary re-invoked.
#[derive(Subcommand)]
pub enum StageCommands {
    /// Fetch an image over HTTP(S)
    Download {
        #[arg(long)]
        url: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, value_parser = parse_hash)]
        expected: Option<Hash>,
    },

    /// Decompress a gzip image stream
    Decompress {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },

    /// Verify file content against a BLAKE3 hash
    ChecksumVerify {
        #[arg(long)]
        path: PathBuf,
        #[arg(long, value_parser = parse_hash)]
        expected: Hash,
    },

    /// Prepare a block device for a fresh image
    DeviceFormat {
        #[arg(long)]
        device: PathBuf,
    },

    /// Write a raw image onto a block device
    ImageWrite {
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        device: PathBuf,
    },

    /// Apply first-boot configuration to an installed image
    PostInstallConfigure {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        document: PathBuf,
    },
}

fn parse_hash(raw: &str) -> Result<Hash, String> {
    Hash::from_hex(raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_subcommands_match_stage_identifiers() {
        // The daemon self-invokes with `stage <identifier>`; a rename on
        // either side breaks every default executor.
        for kind in [
            provd_types::StageKind::Download,
            provd_types::StageKind::Decompress,
            provd_types::StageKind::ChecksumVerify,
            provd_types::StageKind::DeviceFormat,
            provd_types::StageKind::ImageWrite,
            provd_types::StageKind::PostInstallConfigure,
        ] {
            let args = match kind {
                provd_types::StageKind::Download => vec![
                    "provd",
                    "stage",
                    "download",
                    "--url",
                    "https://example.test/os.img",
                    "--output",
                    "/tmp/img",
                ],
                provd_types::StageKind::Decompress => vec![
                    "provd",
                    "stage",
                    "decompress",
                    "--input",
                    "/tmp/in",
                    "--output",
                    "/tmp/out",
                ],
                provd_types::StageKind::ChecksumVerify => vec![
                    "provd",
                    "stage",
                    "checksum-verify",
                    "--path",
                    "/tmp/img",
                    "--expected",
                    "0000000000000000000000000000000000000000000000000000000000000000",
                ],
                provd_types::StageKind::DeviceFormat => {
                    vec!["provd", "stage", "device-format", "--device", "/dev/null"]
                }
                provd_types::StageKind::ImageWrite => vec![
                    "provd",
                    "stage",
                    "image-write",
                    "--image",
                    "/tmp/img",
                    "--device",
                    "/dev/null",
                ],
                provd_types::StageKind::PostInstallConfigure => vec![
                    "provd",
                    "stage",
                    "post-install-configure",
                    "--target",
                    "/mnt",
                    "--document",
                    "/tmp/doc.json",
                ],
                provd_types::StageKind::CacheLookup => continue,
            };
            assert!(
                Cli::try_parse_from(&args).is_ok(),
                "stage {kind} failed to parse"
            );
        }
    }

    #[test]
    fn invalid_hash_is_rejected_at_parse_time() {
        let result = Cli::try_parse_from([
            "provd",
            "stage",
            "checksum-verify",
            "--path",
            "/tmp/img",
            "--expected",
            "not-a-hash",
        ]);
        assert!(result.is_err());
    }
}

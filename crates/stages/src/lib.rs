#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Built-in stage executor programs
//!
//! Each executor is a self-contained operation run as a child process of
//! the daemon (`provd stage <kind> ...`). Executors speak the wire
//! contract: newline-delimited progress records on stdout, exactly one
//! terminal record, free-form diagnostics on stderr, exit 0 on success.
//!
//! Operational failures become failure terminals rather than bare exits,
//! so the supervisor rarely needs to synthesize one for these built-ins.

mod configure;
mod decompress;
mod device;
mod download;
mod report;
mod verify;

pub use configure::apply_configuration;
pub use decompress::decompress_gzip;
pub use device::{format_device, write_image};
pub use download::download;
pub use report::{PercentGate, Reporter};
pub use verify::verify_checksum;

use provd_events::TerminalEvent;
use provd_hash::Hash;
use std::path::PathBuf;

/// One fully-described stage executor invocation
#[derive(Debug, Clone)]
pub enum StageJob {
    Download {
        url: String,
        output: PathBuf,
        expected_hash: Option<Hash>,
    },
    Decompress {
        input: PathBuf,
        output: PathBuf,
    },
    Verify {
        path: PathBuf,
        expected_hash: Hash,
    },
    Format {
        device: PathBuf,
    },
    Write {
        image: PathBuf,
        device: PathBuf,
    },
    Configure {
        target: PathBuf,
        document: PathBuf,
    },
}

/// Run one stage job to completion and return the process exit code
///
/// Always writes exactly one terminal record to stdout, converting any
/// internal error into a failure terminal first.
pub async fn run(job: StageJob) -> i32 {
    let mut reporter = Reporter::stdout();
    let result = match job {
        StageJob::Download {
            url,
            output,
            expected_hash,
        } => download(&url, &output, expected_hash.as_ref(), &mut reporter).await,
        StageJob::Decompress { input, output } => {
            decompress_gzip(&input, &output, &mut reporter).await
        }
        StageJob::Verify {
            path,
            expected_hash,
        } => verify_checksum(&path, &expected_hash, &mut reporter).await,
        StageJob::Format { device } => format_device(&device, &mut reporter).await,
        StageJob::Write { image, device } => write_image(&image, &device, &mut reporter).await,
        StageJob::Configure { target, document } => {
            apply_configuration(&target, &document, &mut reporter).await
        }
    };

    let terminal = match result {
        Ok(terminal) => terminal,
        Err(e) => TerminalEvent::failure(e.to_string()),
    };
    let code = i32::from(!terminal.success);
    reporter.terminal(&terminal);
    code
}

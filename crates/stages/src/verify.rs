//! Checksum verification stage executor

use crate::report::Reporter;
use provd_errors::Error;
use provd_events::TerminalEvent;
use provd_hash::Hash;
use std::io::Write;
use std::path::Path;

/// Hash `path` and compare against `expected`
///
/// A mismatch is the stage's outcome, not an internal error: it comes back
/// as a failure terminal so the caller sees the two hashes.
///
/// # Errors
/// Fails only if the file cannot be read.
pub async fn verify_checksum<W: Write>(
    path: &Path,
    expected: &Hash,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    reporter.progress("Verifying checksum", 0);
    let actual = Hash::hash_file(path).await?;
    reporter.progress("Verifying checksum", 100);

    if &actual == expected {
        Ok(TerminalEvent::success(format!(
            "Checksum verified ({})",
            actual.to_hex()
        )))
    } else {
        Ok(TerminalEvent::failure(format!(
            "checksum mismatch: expected {}, got {}",
            expected.to_hex(),
            actual.to_hex()
        )))
    }
}

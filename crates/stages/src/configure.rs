//! Post-install configuration stage executor
//!
//! Writes the first-boot configuration document onto the freshly written
//! device's boot partition as `key=value` lines. The target may be a block
//! device (mounted here) or an already-mounted directory, which is also
//! what tests pass.

use crate::device::unmount;
use crate::report::Reporter;
use provd_errors::{Error, ExecutorError};
use provd_events::TerminalEvent;
use provd_types::ConfigDocument;
use std::io::Write;
use std::path::Path;

/// File the firmware reads on first boot
const CONFIG_FILE_NAME: &str = "firstboot.cfg";

/// Apply the configuration document at `document` to `target`
///
/// # Errors
/// Fails if the document cannot be read, the device cannot be mounted, or
/// the configuration file cannot be written.
pub async fn apply_configuration<W: Write>(
    target: &Path,
    document: &Path,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    let raw = tokio::fs::read_to_string(document)
        .await
        .map_err(|e| Error::io_with_path(&e, document))?;
    let settings: ConfigDocument = serde_json::from_str(&raw)?;

    reporter.progress("Applying first-boot configuration", 0);

    let is_directory = tokio::fs::metadata(target)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    if is_directory {
        write_settings(target, &settings).await?;
    } else {
        let mount_point = tempfile::tempdir().map_err(|e| ExecutorError::DeviceError {
            device: target.display().to_string(),
            message: format!("failed to create mount point: {e}"),
        })?;
        mount(target, mount_point.path()).await?;
        let written = write_settings(mount_point.path(), &settings).await;
        unmount(mount_point.path()).await;
        written?;
    }

    reporter.progress("Configuration written", 100);
    Ok(TerminalEvent::success(format!(
        "Applied {} configuration settings",
        settings.len()
    )))
}

async fn mount(device: &Path, mount_point: &Path) -> Result<(), Error> {
    let output = tokio::process::Command::new("mount")
        .arg(device)
        .arg(mount_point)
        .output()
        .await
        .map_err(|e| ExecutorError::DeviceError {
            device: device.display().to_string(),
            message: format!("failed to run mount: {e}"),
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ExecutorError::DeviceError {
            device: device.display().to_string(),
            message: format!(
                "mount failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
        .into())
    }
}

async fn write_settings(dir: &Path, settings: &ConfigDocument) -> Result<(), Error> {
    let mut content = String::new();
    for (key, value) in settings {
        content.push_str(key);
        content.push('=');
        content.push_str(value);
        content.push('\n');
    }

    let path = dir.join(CONFIG_FILE_NAME);
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| Error::io_with_path(&e, &path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_sorted_key_value_lines() {
        let temp = tempfile::tempdir().unwrap();
        let document = temp.path().join("config.json");
        std::fs::write(
            &document,
            r#"{"hostname": "sbc-01", "enable_ssh": "true", "timezone": "UTC"}"#,
        )
        .unwrap();

        let mut reporter = Reporter::new(Vec::new());
        let terminal = apply_configuration(temp.path(), &document, &mut reporter)
            .await
            .unwrap();
        assert!(terminal.success);
        assert!(terminal.message.unwrap().contains('3'));

        let written = std::fs::read_to_string(temp.path().join(CONFIG_FILE_NAME)).unwrap();
        // BTreeMap ordering makes the file deterministic
        assert_eq!(written, "enable_ssh=true\nhostname=sbc-01\ntimezone=UTC\n");
    }

    #[tokio::test]
    async fn malformed_document_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let document = temp.path().join("config.json");
        std::fs::write(&document, "not json").unwrap();

        let mut reporter = Reporter::new(Vec::new());
        let result = apply_configuration(temp.path(), &document, &mut reporter).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn empty_document_writes_empty_file() {
        let temp = tempfile::tempdir().unwrap();
        let document = temp.path().join("config.json");
        std::fs::write(&document, "{}").unwrap();

        let mut reporter = Reporter::new(Vec::new());
        let terminal = apply_configuration(temp.path(), &document, &mut reporter)
            .await
            .unwrap();
        assert!(terminal.success);
        assert_eq!(
            std::fs::read_to_string(temp.path().join(CONFIG_FILE_NAME)).unwrap(),
            ""
        );
    }
}

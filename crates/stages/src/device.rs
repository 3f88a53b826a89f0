//! Device preparation and image writing stage executors
//!
//! Both operate on a block device path, but accept any writable file so
//! the logic is testable without real hardware or root.

use crate::report::{PercentGate, Reporter};
use provd_errors::{Error, ExecutorError};
use provd_events::TerminalEvent;
use std::io::Write;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Size of the region zeroed to invalidate MBR and primary GPT structures
const PARTITION_TABLE_WIPE_BYTES: u64 = 1024 * 1024;

/// Best-effort unmount; a device that was never mounted is not an error
pub(crate) async fn unmount(target: &Path) {
    let result = tokio::process::Command::new("umount")
        .arg(target)
        .output()
        .await;
    if let Ok(output) = result {
        if !output.status.success() {
            eprintln!(
                "umount {}: {}",
                target.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
}

fn open_failed(device: &Path, e: &std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ExecutorError::DeviceError {
            device: device.display().to_string(),
            message: "permission denied (not running with device access?)".to_string(),
        }
        .into()
    } else {
        Error::io_with_path(e, device)
    }
}

/// Wipe the partition-table region of `device`
///
/// Unmounts first (best effort), then zeroes the leading region and syncs.
/// The kernel rereads an empty table on the next open.
///
/// # Errors
/// Fails if the device cannot be opened or written.
pub async fn format_device<W: Write>(
    device: &Path,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    reporter.progress(format!("Preparing {}", device.display()), 0);
    unmount(device).await;

    let mut handle = OpenOptions::new()
        .write(true)
        .open(device)
        .await
        .map_err(|e| open_failed(device, &e))?;

    let device_len = handle
        .metadata()
        .await
        .map_err(|e| Error::io_with_path(&e, device))?
        .len();
    // Regular files used in tests may be smaller than the wipe region
    let wipe = if device_len > 0 {
        PARTITION_TABLE_WIPE_BYTES.min(device_len)
    } else {
        PARTITION_TABLE_WIPE_BYTES
    };

    reporter.progress("Clearing partition table", 50);
    #[allow(clippy::cast_possible_truncation)]
    let zeros = vec![0u8; wipe as usize];
    handle
        .write_all(&zeros)
        .await
        .map_err(|e| Error::io_with_path(&e, device))?;
    handle
        .sync_all()
        .await
        .map_err(|e| Error::io_with_path(&e, device))?;

    reporter.progress("Device ready", 100);
    Ok(TerminalEvent::success(format!(
        "Formatted {} ({wipe} bytes cleared)",
        device.display()
    )))
}

/// Stream the raw image at `image` onto `device`
///
/// # Errors
/// Fails if either file cannot be opened or the copy fails.
pub async fn write_image<W: Write>(
    image: &Path,
    device: &Path,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    let total = tokio::fs::metadata(image)
        .await
        .map_err(|e| Error::io_with_path(&e, image))?
        .len();

    let mut source = File::open(image)
        .await
        .map_err(|e| Error::io_with_path(&e, image))?;
    let mut sink = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(device)
        .await
        .map_err(|e| open_failed(device, &e))?;

    reporter.progress(format!("Writing image to {}", device.display()), 0);

    let mut buffer = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;
    let mut gate = PercentGate::new();
    loop {
        let read = source
            .read(&mut buffer)
            .await
            .map_err(|e| Error::io_with_path(&e, image))?;
        if read == 0 {
            break;
        }
        sink.write_all(&buffer[..read])
            .await
            .map_err(|e| Error::io_with_path(&e, device))?;
        written += read as u64;
        if let Some(percent) = gate.advance(written, total) {
            reporter.progress(format!("Wrote {written} of {total} bytes"), percent);
        }
    }

    // The image is not on the device until the kernel says so
    sink.flush()
        .await
        .map_err(|e| Error::io_with_path(&e, device))?;
    sink.sync_all()
        .await
        .map_err(|e| Error::io_with_path(&e, device))?;

    Ok(TerminalEvent::success(format!(
        "Wrote {written} bytes to {}",
        device.display()
    )))
}

//! Download stage executor
//!
//! Streams an HTTP(S) resource to a local file, hashing as it goes.
//! Percent comes from `Content-Length` when the server supplies one.

use crate::report::{PercentGate, Reporter};
use futures::StreamExt;
use provd_errors::{Error, NetworkError};
use provd_events::TerminalEvent;
use provd_hash::Hash;
use std::io::Write;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

fn map_reqwest(url: &str, e: &reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout {
            url: url.to_string(),
        }
    } else if e.is_connect() {
        NetworkError::ConnectionRefused(e.to_string())
    } else if e.is_builder() {
        NetworkError::InvalidUrl(url.to_string())
    } else {
        NetworkError::DownloadFailed(e.to_string())
    }
}

/// Download `url` into `output`
///
/// When `expected` is given the computed content hash is checked here as
/// well, so a corrupted transfer fails fast instead of surviving until the
/// verify stage.
///
/// # Errors
/// Fails on connection errors, non-success HTTP status, or file I/O errors.
pub async fn download<W: Write>(
    url: &str,
    output: &Path,
    expected: Option<&Hash>,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| map_reqwest(url, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(NetworkError::HttpError {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string(),
        }
        .into());
    }

    let total = response.content_length().unwrap_or(0);
    reporter.progress(format!("Downloading {url}"), 0);

    let mut file = File::create(output)
        .await
        .map_err(|e| Error::io_with_path(&e, output))?;
    let mut hasher = blake3::Hasher::new();
    let mut downloaded: u64 = 0;
    let mut gate = PercentGate::new();

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| map_reqwest(url, &e))?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::io_with_path(&e, output))?;
        downloaded += chunk.len() as u64;
        if let Some(percent) = gate.advance(downloaded, total) {
            reporter.progress(format!("Downloaded {downloaded} of {total} bytes"), percent);
        }
    }

    file.flush()
        .await
        .map_err(|e| Error::io_with_path(&e, output))?;

    let hash = Hash::from_bytes(*hasher.finalize().as_bytes());
    if let Some(expected) = expected {
        if &hash != expected {
            return Err(NetworkError::ChecksumMismatch {
                expected: expected.to_hex(),
                actual: hash.to_hex(),
            }
            .into());
        }
    }

    Ok(TerminalEvent::success(format!(
        "Downloaded {downloaded} bytes (blake3 {})",
        hash.to_hex()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn downloads_body_and_reports_hash() {
        let server = MockServer::start();
        let body = vec![0xABu8; 4096];
        let mock = server.mock(|when, then| {
            when.method(GET).path("/os.img");
            then.status(200).body(&body);
        });

        let temp = tempfile::tempdir().unwrap();
        let output = temp.path().join("os.img");
        let mut reporter = Reporter::new(Vec::new());

        let terminal = download(&server.url("/os.img"), &output, None, &mut reporter)
            .await
            .unwrap();

        mock.assert();
        assert!(terminal.success);
        assert_eq!(std::fs::read(&output).unwrap(), body);

        let expected = Hash::from_data(&body);
        assert!(terminal.message.unwrap().contains(&expected.to_hex()));
    }

    #[tokio::test]
    async fn expected_hash_mismatch_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/os.img");
            then.status(200).body("actual content");
        });

        let temp = tempfile::tempdir().unwrap();
        let output = temp.path().join("os.img");
        let wrong = Hash::from_data(b"something else");
        let mut reporter = Reporter::new(Vec::new());

        let result = download(&server.url("/os.img"), &output, Some(&wrong), &mut reporter).await;
        assert!(matches!(
            result,
            Err(Error::Network(NetworkError::ChecksumMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn http_error_status_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing.img");
            then.status(404);
        });

        let temp = tempfile::tempdir().unwrap();
        let output = temp.path().join("missing.img");
        let mut reporter = Reporter::new(Vec::new());

        let result = download(&server.url("/missing.img"), &output, None, &mut reporter).await;
        assert!(matches!(
            result,
            Err(Error::Network(NetworkError::HttpError { status: 404, .. }))
        ));
    }

    #[tokio::test]
    async fn progress_percent_is_monotone() {
        let server = MockServer::start();
        let body = vec![1u8; 64 * 1024];
        server.mock(|when, then| {
            when.method(GET).path("/big.img");
            then.status(200).body(&body);
        });

        let temp = tempfile::tempdir().unwrap();
        let output = temp.path().join("big.img");
        let mut reporter = Reporter::new(Vec::new());

        download(&server.url("/big.img"), &output, None, &mut reporter)
            .await
            .unwrap();

        let lines = String::from_utf8(reporter.into_inner()).unwrap();
        let mut last = 0u8;
        for line in lines.lines() {
            if let Some(provd_events::StageEvent::Progress(p)) =
                provd_events::StageEvent::parse_line(line)
            {
                assert!(p.percent >= last);
                last = p.percent;
            }
        }
    }
}

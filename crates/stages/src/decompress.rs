//! Decompress stage executor
//!
//! Streaming gzip decode. Progress is measured on the compressed side:
//! the decompressed size is unknown up front, but compressed bytes
//! consumed against the input file size gives an honest percentage.

use crate::report::{PercentGate, Reporter};
use async_compression::tokio::bufread::GzipDecoder;
use provd_errors::Error;
use provd_events::TerminalEvent;
use std::io::Write;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Counts bytes pulled through an inner reader
struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let read = (buf.filled().len() - before) as u64;
            self.consumed.fetch_add(read, Ordering::Relaxed);
        }
        result
    }
}

/// Decompress a gzip file at `input` into `output`
///
/// # Errors
/// Fails on I/O errors or a corrupt gzip stream.
pub async fn decompress_gzip<W: Write>(
    input: &Path,
    output: &Path,
    reporter: &mut Reporter<W>,
) -> Result<TerminalEvent, Error> {
    let total = tokio::fs::metadata(input)
        .await
        .map_err(|e| Error::io_with_path(&e, input))?
        .len();

    let source = File::open(input)
        .await
        .map_err(|e| Error::io_with_path(&e, input))?;
    let consumed = Arc::new(AtomicU64::new(0));
    let counting = CountingReader {
        inner: source,
        consumed: Arc::clone(&consumed),
    };
    let mut decoder = GzipDecoder::new(BufReader::with_capacity(COPY_BUF_SIZE, counting));

    let mut sink = File::create(output)
        .await
        .map_err(|e| Error::io_with_path(&e, output))?;

    reporter.progress("Decompressing image", 0);

    let mut buffer = vec![0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;
    let mut gate = PercentGate::new();
    loop {
        let read = decoder
            .read(&mut buffer)
            .await
            .map_err(|e| Error::io_with_path(&e, input))?;
        if read == 0 {
            break;
        }
        sink.write_all(&buffer[..read])
            .await
            .map_err(|e| Error::io_with_path(&e, output))?;
        written += read as u64;

        if let Some(percent) = gate.advance(consumed.load(Ordering::Relaxed), total) {
            reporter.progress(format!("Decompressed {written} bytes"), percent);
        }
    }

    sink.flush()
        .await
        .map_err(|e| Error::io_with_path(&e, output))?;

    Ok(TerminalEvent::success(format!(
        "Decompressed {total} compressed bytes into {written} bytes"
    )))
}

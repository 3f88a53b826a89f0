//! The per-request progress channel
//!
//! A one-way NDJSON stream over the response body. A failed write means
//! the client is gone: it triggers cancellation of the owning request and
//! is never surfaced as a server fault.

use provd_events::StageEvent;
use provd_supervisor::CancelFlag;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Writes stage events to a client connection, one JSON line each
pub struct ProgressChannel<W> {
    writer: W,
    cancel: CancelFlag,
    failed: bool,
}

impl<W: AsyncWrite + Unpin> ProgressChannel<W> {
    pub fn new(writer: W, cancel: CancelFlag) -> Self {
        Self {
            writer,
            cancel,
            failed: false,
        }
    }

    /// Send one event; returns false once the client has disconnected
    ///
    /// The first failed write sets the cancel flag; subsequent sends are
    /// silently dropped so the producer side can drain normally.
    pub async fn send(&mut self, event: &StageEvent) -> bool {
        if self.failed {
            return false;
        }
        let mut line = event.to_line();
        line.push('\n');

        let result = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "progress channel closed by client");
                self.failed = true;
                self.cancel.cancel();
                false
            }
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provd_events::TerminalEvent;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn events_become_ndjson_lines() {
        let mut buffer = Vec::new();
        let mut channel = ProgressChannel::new(&mut buffer, CancelFlag::new());
        assert!(channel.send(&StageEvent::progress("working", 10)).await);
        assert!(
            channel
                .send(&StageEvent::Terminal(TerminalEvent::success("done")))
                .await
        );

        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"success\":true"));
    }

    #[tokio::test]
    async fn write_failure_cancels_the_request() {
        let cancel = CancelFlag::new();
        let mut channel = ProgressChannel::new(BrokenPipe, cancel.clone());

        assert!(!channel.send(&StageEvent::progress("working", 10)).await);
        assert!(cancel.is_cancelled());
        assert!(!channel.is_open());

        // Later sends are dropped without touching the writer again
        assert!(!channel.send(&StageEvent::progress("more", 20)).await);
    }
}

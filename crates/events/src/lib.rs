#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Stage event system for provd
//!
//! Every stage executor communicates through [`StageEvent`]s: zero or more
//! progress events followed by exactly one terminal event. The same type
//! flows through the whole system: produced by executors as NDJSON on
//! stdout, re-emitted by the supervisor, rescaled by the pipeline, and
//! finally framed onto the progress channel. All output goes through
//! events; nothing in the pipeline prints directly.

pub mod wire;

pub use wire::{DiagnosticEvent, ProgressEvent, StageEvent, TerminalEvent};

use tokio::sync::mpsc;

/// Default capacity of the bounded per-stage event queue
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Sender half of a stage event queue
pub type EventSender = mpsc::Sender<StageEvent>;

/// Receiver half of a stage event queue
pub type EventReceiver = mpsc::Receiver<StageEvent>;

/// Create a bounded stage event queue
///
/// The queue is bounded so a runaway executor cannot exhaust memory; the
/// reader tasks apply backpressure instead.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (tx, mut rx) = channel();
        tx.send(StageEvent::progress("a", 1)).await.unwrap();
        tx.send(StageEvent::progress("b", 2)).await.unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, StageEvent::Progress(p) if p.message == "a"));
        assert!(matches!(second, StageEvent::Progress(p) if p.message == "b"));
        assert!(rx.recv().await.is_none());
    }
}

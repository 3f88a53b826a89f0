//! Stdout reporting for stage executors
//!
//! Every record is one flushed line; the supervisor reads line by line and
//! an unflushed buffer would look like silence.

use provd_events::{StageEvent, TerminalEvent};
use std::io::Write;

/// Writes wire records to an output stream, one line per record
pub struct Reporter<W: Write = std::io::Stdout> {
    out: W,
}

impl Reporter {
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl<W: Write> Reporter<W> {
    #[must_use]
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Emit a progress record; write failures are ignored (a vanished
    /// supervisor will reap us shortly anyway)
    pub fn progress(&mut self, message: impl Into<String>, percent: u8) {
        self.line(&StageEvent::progress(message, percent).to_line());
    }

    /// Emit the terminal record
    pub fn terminal(&mut self, terminal: &TerminalEvent) {
        self.line(&StageEvent::Terminal(terminal.clone()).to_line());
    }

    fn line(&mut self, line: &str) {
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }

    #[must_use]
    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Emits progress only when the integer percent actually advances,
/// so byte-granular loops do not flood the channel
pub struct PercentGate {
    last: Option<u8>,
}

impl PercentGate {
    #[must_use]
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Returns the percent to report for `done` of `total` bytes, or
    /// `None` if it has not advanced since the last report
    pub fn advance(&mut self, done: u64, total: u64) -> Option<u8> {
        if total == 0 {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let percent = ((done.min(total) * 100) / total) as u8;
        if self.last == Some(percent) {
            return None;
        }
        self.last = Some(percent);
        Some(percent)
    }
}

impl Default for PercentGate {
    fn default() -> Self {
        Self::new()
    }
}

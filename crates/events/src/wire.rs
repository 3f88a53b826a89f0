//! Wire records for the stage executor contract and the progress channel
//!
//! Stage executors emit newline-delimited JSON on stdout:
//!
//! - progress: `{"type": "progress", "message": "...", "percent": 42}`
//! - terminal: `{"success": true, "message": "..."}` or
//!   `{"success": false, "error": "...", "debug_info": "..."}`
//!
//! The terminal record intentionally carries no `type` tag; any object with
//! a `success` field is terminal. Unparseable stdout lines and everything
//! on stderr become diagnostic events rather than being discarded.

use provd_types::StageKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A progress report from a running stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage identifier, attached by the supervisor (executors omit it)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    pub message: String,
    /// 0–100, stage-local until the pipeline rescales it
    pub percent: u8,
}

/// Free-form diagnostic output captured from a stage's stderr
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    pub line: String,
}

/// The single definitive outcome of a stage or a whole request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

impl TerminalEvent {
    /// A successful outcome with a message
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            debug_info: None,
        }
    }

    /// A failed outcome with an error description
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            debug_info: None,
        }
    }

    /// Attach a diagnostic payload (captured stderr tail, exit status, ...)
    #[must_use]
    pub fn with_debug_info(mut self, debug_info: impl Into<String>) -> Self {
        self.debug_info = Some(debug_info.into());
        self
    }

    /// Append a warning to an otherwise successful outcome
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        let warning = warning.into();
        self.message = Some(match self.message.take() {
            Some(msg) => format!("{msg} (warning: {warning})"),
            None => format!("warning: {warning}"),
        });
        self
    }
}

/// A discriminated stage event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageEvent {
    Progress(ProgressEvent),
    Diagnostic(DiagnosticEvent),
    Terminal(TerminalEvent),
}

impl StageEvent {
    /// Convenience constructor for a stage-local progress event
    #[must_use]
    pub fn progress(message: impl Into<String>, percent: u8) -> Self {
        Self::Progress(ProgressEvent {
            stage: None,
            message: message.into(),
            percent: percent.min(100),
        })
    }

    /// Convenience constructor for a diagnostic line
    #[must_use]
    pub fn diagnostic(line: impl Into<String>) -> Self {
        Self::Diagnostic(DiagnosticEvent {
            stage: None,
            line: line.into(),
        })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Attach the stage identifier (supervisor-side)
    #[must_use]
    pub fn with_stage(mut self, kind: StageKind) -> Self {
        match &mut self {
            Self::Progress(p) => p.stage = Some(kind),
            Self::Diagnostic(d) => d.stage = Some(kind),
            Self::Terminal(_) => {}
        }
        self
    }

    /// Serialize to one NDJSON line (without the trailing newline)
    ///
    /// # Panics
    /// Never panics: all event variants serialize to plain JSON objects.
    #[must_use]
    pub fn to_line(&self) -> String {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Tagged<'a> {
            Progress(&'a ProgressEvent),
            Diagnostic(&'a DiagnosticEvent),
        }

        let value = match self {
            Self::Progress(p) => serde_json::to_string(&Tagged::Progress(p)),
            Self::Diagnostic(d) => serde_json::to_string(&Tagged::Diagnostic(d)),
            Self::Terminal(t) => serde_json::to_string(t),
        };
        value.unwrap_or_else(|_| String::from("{}"))
    }

    /// Parse one stdout line from a stage executor
    ///
    /// Returns `None` for lines that are not structured records; callers
    /// wrap those into diagnostics.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let obj = value.as_object()?;

        if obj.contains_key("success") {
            let terminal: TerminalEvent = serde_json::from_value(value).ok()?;
            return Some(Self::Terminal(terminal));
        }

        match obj.get("type").and_then(Value::as_str) {
            Some("progress") => {
                let progress: ProgressEvent = serde_json::from_value(value).ok()?;
                Some(Self::Progress(progress))
            }
            Some("diagnostic") => {
                let diagnostic: DiagnosticEvent = serde_json::from_value(value).ok()?;
                Some(Self::Diagnostic(diagnostic))
            }
            _ => None,
        }
    }
}

//! Stage executor command description

use provd_types::StageKind;
use std::path::PathBuf;

/// The external program to run for one stage
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub kind: StageKind,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl StageCommand {
    #[must_use]
    pub fn new(kind: StageKind, program: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

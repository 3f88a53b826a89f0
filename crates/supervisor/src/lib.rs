#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Child-process supervision for stage executors
//!
//! A [`Supervisor`] runs exactly one stage executor as a child process and
//! yields its stage events live. Standard output and standard error are
//! drained on independent tasks into a single bounded queue, so a slow or
//! silent stream cannot starve the other. Three independent triggers
//! terminate a stage (silence/overall timeout, caller cancellation, and
//! global shutdown), and all converge on the same path: SIGTERM, bounded
//! grace, SIGKILL, then a final drain.
//!
//! The load-bearing guarantee: every run yields exactly one terminal
//! event. If the child never produced one (crash, kill, non-zero exit with
//! no structured output), the supervisor synthesizes a failure terminal
//! carrying the exit status and the captured diagnostic tail.

mod cancel;
mod command;
mod registry;
mod supervise;

pub use cancel::CancelFlag;
pub use command::StageCommand;
pub use registry::{ActiveProcessRecord, ProcessRegistry};
pub use supervise::{StageOutcome, Supervisor, SupervisorConfig, TerminationKind};

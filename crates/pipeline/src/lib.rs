#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Stage planning and pipeline execution
//!
//! A [`StagePlan`] decides which stages run for a request and how each
//! stage's local progress maps onto the global 0–100 percentage. The
//! [`PipelineController`] executes the plan through the process
//! supervisor and guarantees one request-level terminal event.

mod command;
mod controller;
mod plan;

pub use command::executor_command;
pub use controller::PipelineController;
pub use plan::{PlanInputs, PlannedStage, StagePlan};

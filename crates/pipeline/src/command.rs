//! Stage executor command construction
//!
//! Stage executors are external programs. By default the daemon re-invokes
//! its own binary (`provd stage <kind> ...`); a config override swaps in a
//! different program for a stage, which is also how tests substitute
//! scripted executors.

use provd_config::StagesConfig;
use provd_errors::Error;
use provd_supervisor::StageCommand;
use provd_types::StageKind;

/// Build the command for one stage, honoring config overrides
///
/// # Errors
/// Fails only if the current executable path cannot be resolved.
pub fn executor_command(
    config: &StagesConfig,
    kind: StageKind,
    stage_args: Vec<String>,
) -> Result<StageCommand, Error> {
    if let Some(over) = config.overrides.get(kind.as_str()) {
        return Ok(StageCommand::new(kind, over.program.clone())
            .args(over.args.clone())
            .args(stage_args));
    }

    let current = std::env::current_exe()
        .map_err(|e| Error::internal(format!("cannot resolve own executable: {e}")))?;
    Ok(StageCommand::new(kind, current)
        .arg("stage")
        .arg(kind.as_str())
        .args(stage_args))
}

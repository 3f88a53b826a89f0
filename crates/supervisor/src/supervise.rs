//! The supervision driver
//!
//! One `run` call per stage: spawn the executor, drain both output streams
//! into one queue, watch for silence/overall timeouts and cancellation,
//! escalate termination, and always resolve to exactly one terminal event.

use crate::cancel::CancelFlag;
use crate::command::StageCommand;
use crate::registry::{terminate_gracefully, ActiveProcessRecord, ProcessRegistry};
use provd_errors::{Error, ExecutorError};
use provd_events::{EventSender, StageEvent, TerminalEvent};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long the final drain waits for straggling output after child exit
const FINAL_DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Tunables for one supervised stage run
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Silence timeout is suppressed for this long after spawn
    pub startup_grace: Duration,
    /// Terminate if no output arrives for this long (after the grace)
    pub silence_timeout: Duration,
    /// Bound on total stage duration regardless of output
    pub overall_timeout: Option<Duration>,
    /// Wait between SIGTERM and SIGKILL
    pub termination_grace: Duration,
    /// Queue wait quantum; shutdown and stall checks run at this cadence
    pub poll_interval: Duration,
    /// Diagnostic lines retained for synthetic failures
    pub tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(120),
            silence_timeout: Duration::from_secs(1800),
            overall_timeout: None,
            termination_grace: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            tail_lines: 50,
        }
    }
}

/// Why the stage stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// The child ran to completion on its own
    Completed,
    SilenceTimeout,
    OverallTimeout,
    Cancelled,
}

/// Result of one supervised stage run
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// The single terminal event (child-produced or synthetic)
    pub terminal: TerminalEvent,
    pub termination: TerminationKind,
    /// Child exit code, if it exited normally
    pub exit_status: Option<i32>,
}

impl StageOutcome {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.termination == TerminationKind::Cancelled
    }
}

/// Runs stage executors as supervised child processes
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
}

impl Supervisor {
    #[must_use]
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run one stage executor to its terminal event
    ///
    /// Progress and diagnostic events are forwarded to `events` (tagged
    /// with the stage) as they arrive; the terminal event is returned in
    /// the outcome rather than forwarded, so the caller decides how it is
    /// surfaced. If `events` closes mid-run the stage is cancelled, since a
    /// dropped consumer means the client is gone.
    ///
    /// # Errors
    /// Returns an error only if the executor cannot be spawned; everything
    /// after spawn resolves to a terminal event instead.
    pub async fn run(
        &self,
        request_id: Uuid,
        command: &StageCommand,
        config: &SupervisorConfig,
        events: &EventSender,
        cancel: &CancelFlag,
    ) -> Result<StageOutcome, Error> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed {
                program: command.program.display().to_string(),
                message: e.to_string(),
            })?;

        let process_id = Uuid::new_v4();
        if let Some(pid) = child.id() {
            #[allow(clippy::cast_possible_wrap)]
            self.registry.register(ActiveProcessRecord {
                process_id,
                request_id,
                stage: command.kind,
                pid: pid as i32,
                started_at: Instant::now(),
            });
        }

        debug!(
            request = %request_id,
            stage = %command.kind,
            program = %command.program.display(),
            "stage executor started"
        );

        let outcome = drive(&mut child, command, config, events, cancel).await;
        self.registry.deregister(process_id);
        outcome
    }
}

/// Drive a spawned child to its outcome
async fn drive(
    child: &mut Child,
    command: &StageCommand,
    config: &SupervisorConfig,
    events: &EventSender,
    cancel: &CancelFlag,
) -> Result<StageOutcome, Error> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::internal("child stderr not captured"))?;

    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let (queue_tx, mut queue_rx) = provd_events::channel();

    // stdout: structured records; anything unparseable becomes diagnostic
    let stdout_tail = Arc::clone(&tail);
    let stdout_tx = queue_tx.clone();
    let tail_lines = config.tail_lines;
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match StageEvent::parse_line(&line) {
                Some(event) => event,
                None => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    push_tail(&stdout_tail, tail_lines, &line);
                    StageEvent::diagnostic(line)
                }
            };
            if stdout_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    // stderr: free-form diagnostics, all captured in the tail
    let stderr_tail = Arc::clone(&tail);
    let stderr_tx = queue_tx;
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            push_tail(&stderr_tail, tail_lines, &line);
            if stderr_tx.send(StageEvent::diagnostic(line)).await.is_err() {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut last_output = Instant::now();
    let mut terminal: Option<TerminalEvent> = None;
    let mut termination = TerminationKind::Completed;

    // The stop conditions are re-checked on every pass, so a chatty child
    // that keeps the queue busy cannot outrun cancellation or a deadline.
    loop {
        if cancel.is_cancelled() {
            termination = TerminationKind::Cancelled;
            break;
        }
        let elapsed = started.elapsed();
        if let Some(overall) = config.overall_timeout {
            if elapsed > overall {
                termination = TerminationKind::OverallTimeout;
                break;
            }
        }
        if elapsed > config.startup_grace && last_output.elapsed() > config.silence_timeout {
            termination = TerminationKind::SilenceTimeout;
            break;
        }

        match timeout(config.poll_interval, queue_rx.recv()).await {
            Ok(Some(event)) => {
                last_output = Instant::now();
                if let StageEvent::Terminal(t) = event {
                    terminal = Some(t);
                } else if events.send(event.with_stage(command.kind)).await.is_err() {
                    // Consumer gone: the client disconnected. Not an error;
                    // the check at the top of the loop breaks out next pass.
                    cancel.cancel();
                }
            }
            Ok(None) => break, // both streams closed; child is exiting
            Err(_) => {}
        }
    }

    if termination != TerminationKind::Completed {
        terminate(child, config.termination_grace).await;
    }

    let exit_status = match timeout(config.termination_grace, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            warn!(stage = %command.kind, "failed to reap stage executor: {e}");
            None
        }
        Err(_) => {
            // Streams closed but the child lingers; force it down
            let _ = child.start_kill();
            match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            }
        }
    };

    // Drain whatever final output made it into the queue before exit
    loop {
        match timeout(FINAL_DRAIN_WINDOW, queue_rx.recv()).await {
            Ok(Some(StageEvent::Terminal(t))) => terminal = Some(t),
            Ok(Some(event)) => {
                let _ = events.send(event.with_stage(command.kind)).await;
            }
            Ok(None) | Err(_) => break,
        }
    }

    let terminal = resolve_terminal(terminal, termination, exit_status, config, &tail);

    debug!(
        stage = %command.kind,
        success = terminal.success,
        ?termination,
        exit_status,
        "stage executor finished"
    );

    Ok(StageOutcome {
        terminal,
        termination,
        exit_status,
    })
}

/// The exactly-one-terminal guarantee
///
/// Whatever happened above, this function returns a terminal event: the
/// child's own if it completed normally, a synthetic failure otherwise.
fn resolve_terminal(
    terminal: Option<TerminalEvent>,
    termination: TerminationKind,
    exit_status: Option<i32>,
    config: &SupervisorConfig,
    tail: &Arc<Mutex<VecDeque<String>>>,
) -> TerminalEvent {
    let tail_text = || {
        let tail = tail.lock().map(|t| t.iter().cloned().collect::<Vec<_>>());
        match tail {
            Ok(lines) if !lines.is_empty() => Some(lines.join("\n")),
            _ => None,
        }
    };

    let with_tail = |terminal: TerminalEvent| match tail_text() {
        Some(text) => terminal.with_debug_info(text),
        None => terminal,
    };

    match termination {
        TerminationKind::Completed => match terminal {
            Some(t) => t,
            None => {
                let status = exit_status.unwrap_or(-1);
                with_tail(TerminalEvent::failure(
                    ExecutorError::NoTerminalRecord { status }.to_string(),
                ))
            }
        },
        TerminationKind::SilenceTimeout => with_tail(TerminalEvent::failure(
            ExecutorError::SilenceTimeout {
                seconds: config.silence_timeout.as_secs(),
            }
            .to_string(),
        )),
        TerminationKind::OverallTimeout => with_tail(TerminalEvent::failure(
            ExecutorError::OverallTimeout {
                seconds: config.overall_timeout.unwrap_or_default().as_secs(),
            }
            .to_string(),
        )),
        TerminationKind::Cancelled => TerminalEvent::failure(ExecutorError::Cancelled.to_string()),
    }
}

/// Graceful termination with bounded escalation to SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        terminate_gracefully(pid as i32);
    } else {
        return; // already exited
    }

    if timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
    }
}

fn push_tail(tail: &Arc<Mutex<VecDeque<String>>>, limit: usize, line: &str) {
    if let Ok(mut tail) = tail.lock() {
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}

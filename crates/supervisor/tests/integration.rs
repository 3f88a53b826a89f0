//! Supervision integration tests using scripted stage executors

use provd_events::StageEvent;
use provd_supervisor::{
    CancelFlag, ProcessRegistry, StageCommand, Supervisor, SupervisorConfig, TerminationKind,
};
use provd_types::StageKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn sh_command(kind: StageKind, script: &PathBuf) -> StageCommand {
    StageCommand::new(kind, "/bin/sh").arg(script.display().to_string())
}

fn quick_config() -> SupervisorConfig {
    SupervisorConfig {
        startup_grace: Duration::from_millis(0),
        silence_timeout: Duration::from_secs(10),
        overall_timeout: None,
        termination_grace: Duration::from_millis(500),
        poll_interval: Duration::from_millis(50),
        tail_lines: 20,
    }
}

fn supervisor() -> Supervisor {
    Supervisor::new(Arc::new(ProcessRegistry::new()))
}

#[tokio::test]
async fn well_behaved_executor_yields_its_terminal() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        &temp,
        "ok.sh",
        r#"
echo '{"type": "progress", "message": "halfway", "percent": 50}'
echo '{"success": true, "message": "done"}'
exit 0
"#,
    );

    let (tx, mut rx) = provd_events::channel();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::Download, &script),
            &quick_config(),
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::Completed);
    assert_eq!(outcome.exit_status, Some(0));
    assert!(outcome.terminal.success);
    assert_eq!(outcome.terminal.message.as_deref(), Some("done"));

    drop(tx);
    let forwarded = rx.recv().await.unwrap();
    match forwarded {
        StageEvent::Progress(p) => {
            assert_eq!(p.message, "halfway");
            assert_eq!(p.percent, 50);
            assert_eq!(p.stage, Some(StageKind::Download));
        }
        other => panic!("expected progress, got {other:?}"),
    }
}

#[tokio::test]
async fn nonzero_exit_without_terminal_synthesizes_failure() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        &temp,
        "fail.sh",
        r#"
echo "Permission denied" >&2
exit 1
"#,
    );

    let (tx, _rx) = provd_events::channel();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::DeviceFormat, &script),
            &quick_config(),
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.exit_status, Some(1));
    assert!(!outcome.terminal.success);
    let error = outcome.terminal.error.unwrap();
    assert!(error.contains("status 1"), "error was: {error}");
    let debug_info = outcome.terminal.debug_info.unwrap();
    assert!(debug_info.contains("Permission denied"));
}

#[tokio::test]
async fn zero_exit_without_terminal_is_still_a_failure() {
    let temp = TempDir::new().unwrap();
    let script = write_script(&temp, "silent-ok.sh", "exit 0\n");

    let (tx, _rx) = provd_events::channel();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::ChecksumVerify, &script),
            &quick_config(),
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert!(!outcome.terminal.success);
    assert!(outcome.terminal.error.unwrap().contains("status 0"));
}

#[tokio::test]
async fn silence_timeout_terminates_the_stage() {
    let temp = TempDir::new().unwrap();
    let script = write_script(&temp, "stall.sh", "sleep 30\n");

    let config = SupervisorConfig {
        silence_timeout: Duration::from_millis(200),
        ..quick_config()
    };

    let (tx, _rx) = provd_events::channel();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::ImageWrite, &script),
            &config,
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::SilenceTimeout);
    assert!(!outcome.terminal.success);
    assert!(outcome.terminal.error.unwrap().contains("no output"));
}

#[tokio::test]
async fn startup_grace_suppresses_silence_timeout() {
    let temp = TempDir::new().unwrap();
    // Quiet for longer than the silence timeout, but within the grace
    let script = write_script(
        &temp,
        "slow-start.sh",
        r#"
sleep 1
echo '{"success": true, "message": "started late"}'
"#,
    );

    let config = SupervisorConfig {
        startup_grace: Duration::from_secs(5),
        silence_timeout: Duration::from_millis(200),
        ..quick_config()
    };

    let (tx, _rx) = provd_events::channel();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::Download, &script),
            &config,
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::Completed);
    assert!(outcome.terminal.success);
}

#[tokio::test]
async fn overall_timeout_kills_an_executor_that_ignores_sigterm() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        &temp,
        "stubborn.sh",
        r#"
trap '' TERM
i=0
while [ $i -lt 100 ]; do
  echo '{"type": "progress", "message": "still going", "percent": 1}'
  sleep 0.2
  i=$((i + 1))
done
"#,
    );

    let config = SupervisorConfig {
        overall_timeout: Some(Duration::from_millis(400)),
        termination_grace: Duration::from_millis(300),
        ..quick_config()
    };

    let (tx, mut rx) = provd_events::channel();
    let consumer = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let started = std::time::Instant::now();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::DeviceFormat, &script),
            &config,
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::OverallTimeout);
    assert!(!outcome.terminal.success);
    assert!(outcome.terminal.error.unwrap().contains("maximum duration"));
    // SIGTERM is ignored, so the kill path must have bounded the wait
    assert!(started.elapsed() < Duration::from_secs(5));

    drop(tx);
    consumer.await.unwrap();
}

#[tokio::test]
async fn cancellation_terminates_promptly() {
    let temp = TempDir::new().unwrap();
    let script = write_script(&temp, "long.sh", "sleep 30\n");

    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let (tx, _rx) = provd_events::channel();
    let started = std::time::Instant::now();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::ImageWrite, &script),
            &quick_config(),
            &tx,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::Cancelled);
    assert!(outcome.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_interrupts_a_chatty_executor() {
    let temp = TempDir::new().unwrap();
    // Emits far more often than the poll interval, so cancellation must be
    // observed between events rather than on a quiet queue
    let script = write_script(
        &temp,
        "chatty.sh",
        r#"
i=0
while [ $i -lt 200 ]; do
  echo '{"type": "progress", "message": "copying", "percent": 1}'
  sleep 0.1
  i=$((i + 1))
done
echo '{"success": true, "message": "done"}'
"#,
    );

    let config = SupervisorConfig {
        poll_interval: Duration::from_millis(500),
        ..quick_config()
    };

    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let (tx, mut rx) = provd_events::channel();
    let consumer = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let started = std::time::Instant::now();
    let outcome = supervisor()
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::ImageWrite, &script),
            &config,
            &tx,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(outcome.termination, TerminationKind::Cancelled);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "ran {:?} before stopping",
        started.elapsed()
    );

    drop(tx);
    consumer.await.unwrap();
}

#[tokio::test]
async fn registry_is_empty_after_each_run() {
    let temp = TempDir::new().unwrap();
    let script = write_script(
        &temp,
        "ok.sh",
        "echo '{\"success\": true, \"message\": \"fine\"}'\n",
    );

    let registry = Arc::new(ProcessRegistry::new());
    let supervisor = Supervisor::new(Arc::clone(&registry));

    let (tx, _rx) = provd_events::channel();
    supervisor
        .run(
            Uuid::new_v4(),
            &sh_command(StageKind::Download, &script),
            &quick_config(),
            &tx,
            &CancelFlag::new(),
        )
        .await
        .unwrap();

    assert!(registry.is_empty());
}

#[tokio::test]
async fn spawn_failure_is_an_error() {
    let (tx, _rx) = provd_events::channel();
    let command = StageCommand::new(StageKind::Download, "/nonexistent/executor");
    let result = supervisor()
        .run(
            Uuid::new_v4(),
            &command,
            &quick_config(),
            &tx,
            &CancelFlag::new(),
        )
        .await;
    assert!(result.is_err());
}

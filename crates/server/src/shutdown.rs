//! Process-wide shutdown state and the active-request set
//!
//! The coordinator owns the `Running → ShuttingDown → Stopped` state
//! machine. Request handlers register themselves (with their cancellation
//! flag) for the duration of handling; beginning shutdown cancels every
//! in-flight request, which sends running stages down the supervisor's
//! graceful termination path. The coordinator then waits (bounded) for the
//! set to drain before anything still running gets force-killed. It only
//! observes the process registry, it never owns child processes.

use dashmap::DashMap;
use provd_supervisor::CancelFlag;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    ShuttingDown,
    Stopped,
}

impl ServerState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::ShuttingDown => 1,
            Self::Stopped => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::ShuttingDown,
            2 => Self::Stopped,
            _ => Self::Running,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

/// What triggered the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    UserRequest,
    Error(String),
}

/// RAII registration of one in-flight request
pub struct ActiveRequestGuard {
    coordinator: Arc<ShutdownCoordinator>,
    request_id: Uuid,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.coordinator.active.remove(&self.request_id);
    }
}

/// Tracks lifecycle state and in-flight requests
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    reason: Mutex<Option<ShutdownReason>>,
    active: DashMap<Uuid, CancelFlag>,
    notify: watch::Sender<ServerState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = watch::channel(ServerState::Running);
        Self {
            state: AtomicU8::new(ServerState::Running.as_u8()),
            reason: Mutex::new(None),
            active: DashMap::new(),
            notify,
        }
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Wakeups for the accept loop and anything else that waits on state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.notify.subscribe()
    }

    /// Begin shutdown; returns false if it had already begun
    ///
    /// Every in-flight request is cancelled, so its supervisor terminates
    /// the running stage the same way a timeout or client disconnect would.
    pub fn begin_shutdown(&self, reason: ShutdownReason) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                ServerState::Running.as_u8(),
                ServerState::ShuttingDown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            info!(?reason, "shutdown initiated");
            if let Ok(mut slot) = self.reason.lock() {
                *slot = Some(reason);
            }
            for entry in self.active.iter() {
                entry.value().cancel();
            }
            let _ = self.notify.send(ServerState::ShuttingDown);
        }
        transitioned
    }

    pub fn mark_stopped(&self) {
        self.state
            .store(ServerState::Stopped.as_u8(), Ordering::Release);
        let _ = self.notify.send(ServerState::Stopped);
    }

    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// Register an in-flight request; dropping the guard deregisters it
    ///
    /// A request that loses the race with `begin_shutdown` is cancelled on
    /// the spot instead of slipping past the sweep.
    #[must_use]
    pub fn register_request(
        self: &Arc<Self>,
        request_id: Uuid,
        cancel: CancelFlag,
    ) -> ActiveRequestGuard {
        if !self.is_running() {
            cancel.cancel();
        }
        self.active.insert(request_id, cancel);
        ActiveRequestGuard {
            coordinator: Arc::clone(self),
            request_id,
        }
    }

    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.active.len()
    }

    /// Wait for the active-request set to drain, bounded by `grace`
    ///
    /// Returns true if every request finished in time.
    pub async fn drain(&self, grace: Duration, poll_interval: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.active.len();
            if remaining == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "graceful drain window elapsed");
                return false;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_shutdown_transitions_once() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.is_running());
        assert!(coordinator.begin_shutdown(ShutdownReason::UserRequest));
        assert!(!coordinator.begin_shutdown(ShutdownReason::Signal(15)));
        assert_eq!(coordinator.state(), ServerState::ShuttingDown);
        assert_eq!(coordinator.reason(), Some(ShutdownReason::UserRequest));
    }

    #[test]
    fn guard_tracks_active_requests() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let guard = coordinator.register_request(Uuid::new_v4(), CancelFlag::new());
        let other = coordinator.register_request(Uuid::new_v4(), CancelFlag::new());
        assert_eq!(coordinator.active_requests(), 2);
        drop(guard);
        assert_eq!(coordinator.active_requests(), 1);
        drop(other);
        assert_eq!(coordinator.active_requests(), 0);
    }

    #[test]
    fn begin_shutdown_cancels_in_flight_requests() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let cancel = CancelFlag::new();
        let _guard = coordinator.register_request(Uuid::new_v4(), cancel.clone());
        assert!(!cancel.is_cancelled());

        coordinator.begin_shutdown(ShutdownReason::Signal(15));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn registration_after_shutdown_is_cancelled_immediately() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.begin_shutdown(ShutdownReason::UserRequest);

        let late = CancelFlag::new();
        let _guard = coordinator.register_request(Uuid::new_v4(), late.clone());
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn drain_returns_early_when_empty() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        assert!(
            coordinator
                .drain(Duration::from_secs(5), Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn drain_times_out_with_requests_in_flight() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let _guard = coordinator.register_request(Uuid::new_v4(), CancelFlag::new());
        assert!(
            !coordinator
                .drain(Duration::from_millis(50), Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn drain_observes_completion() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let guard = coordinator.register_request(Uuid::new_v4(), CancelFlag::new());

        let waiter = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move {
            waiter
                .drain(Duration::from_secs(5), Duration::from_millis(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let coordinator = ShutdownCoordinator::new();
        let mut sub = coordinator.subscribe();
        assert_eq!(*sub.borrow(), ServerState::Running);

        coordinator.begin_shutdown(ShutdownReason::Signal(2));
        sub.changed().await.unwrap();
        assert_eq!(*sub.borrow(), ServerState::ShuttingDown);
    }
}

#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! The provisioning server
//!
//! Accepts connections on a TCP listener, admits requests through the
//! rate limiter and shutdown state, and routes them into the pipeline
//! controller. Progress is streamed back as NDJSON when the request asks
//! for it. Shutdown stops the accept loop, drains in-flight requests
//! within a bounded grace window, and force-kills whatever is left.

mod channel;
mod http;
mod limiter;
mod shutdown;

pub use channel::ProgressChannel;
pub use http::{read_request, HttpRequest};
pub use limiter::{Admission, RateLimiter};
pub use shutdown::{ActiveRequestGuard, ServerState, ShutdownCoordinator, ShutdownReason};

use provd_cache::CacheManager;
use provd_config::Config;
use provd_errors::{Error, InputError, ServerError};
use provd_events::{StageEvent, TerminalEvent};
use provd_pipeline::PipelineController;
use provd_supervisor::{CancelFlag, ProcessRegistry, Supervisor};
use provd_types::{ProvisioningRequest, RawProvisioningRequest};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// The long-lived server instance
pub struct Server {
    config: Arc<Config>,
    controller: PipelineController,
    coordinator: Arc<ShutdownCoordinator>,
    limiter: RateLimiter,
    registry: Arc<ProcessRegistry>,
}

impl Server {
    #[must_use]
    pub fn new(config: Arc<Config>, cache: Arc<CacheManager>) -> Self {
        let registry = Arc::new(ProcessRegistry::new());
        let supervisor = Supervisor::new(Arc::clone(&registry));
        let controller = PipelineController::new(cache, supervisor, Arc::clone(&config));
        let limiter = RateLimiter::new(
            Duration::from_secs(config.limits.window_seconds),
            config.limits.max_requests_per_window,
        );

        Self {
            config,
            controller,
            coordinator: Arc::new(ShutdownCoordinator::new()),
            limiter,
            registry,
        }
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Bind the configured listen address
    ///
    /// # Errors
    /// Returns [`ServerError::BindFailed`] if the address is unavailable.
    pub async fn bind(&self) -> Result<TcpListener, Error> {
        TcpListener::bind(&self.config.server.listen)
            .await
            .map_err(|e| {
                ServerError::BindFailed {
                    addr: self.config.server.listen.clone(),
                    message: e.to_string(),
                }
                .into()
            })
    }

    /// Run the accept loop until shutdown, then drain and stop
    ///
    /// # Errors
    /// Infallible in practice; the signature leaves room for accept-loop
    /// level failures.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "provisioning server listening");
        }

        let mut state = self.coordinator.subscribe();
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() != ServerState::Running {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        // Stop accepting, then give in-flight requests their grace window
        drop(listener);
        let grace = Duration::from_secs(self.config.server.shutdown_grace_seconds);
        let drained = self
            .coordinator
            .drain(grace, self.config.timeouts.poll_interval())
            .await;

        if !drained {
            let killed = self.registry.kill_all();
            warn!(killed, "force-killed remaining stage executors");
            // Supervisors observe the kill and deregister promptly
            let _ = self
                .coordinator
                .drain(Duration::from_secs(5), Duration::from_millis(100))
                .await;
        }

        self.coordinator.mark_stopped();
        info!("server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let request =
            match http::read_request(&mut reader, self.config.server.max_body_bytes).await {
                Ok(request) => request,
                Err(e) => {
                    let _ = http::write_json(&mut write, 400, &json!({"error": e.to_string()}))
                        .await;
                    return;
                }
            };

        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/health") => {
                let body = json!({
                    "status": self.coordinator.state().as_str(),
                    "active_requests": self.coordinator.active_requests(),
                });
                let _ = http::write_json(&mut write, 200, &body).await;
            }
            ("POST", "/provision") => {
                self.handle_provision(&request.body, peer, write).await;
            }
            _ => {
                let _ = http::write_json(&mut write, 404, &json!({"error": "not found"})).await;
            }
        }
    }

    async fn handle_provision(&self, body: &[u8], peer: SocketAddr, mut write: OwnedWriteHalf) {
        if !self.coordinator.is_running() {
            let _ = http::write_json(
                &mut write,
                503,
                &json!({"error": ServerError::ShuttingDown.to_string()}),
            )
            .await;
            return;
        }

        if let Admission::Denied {
            retry_after_seconds,
        } = self.limiter.admit(peer.ip())
        {
            debug!(client = %peer.ip(), retry_after_seconds, "request rate limited");
            let denied = ServerError::RateLimited {
                retry_after_seconds,
            };
            let _ = http::write_response(
                &mut write,
                429,
                &[("Retry-After", retry_after_seconds.to_string())],
                "application/json",
                json!({"error": denied.to_string()}).to_string().as_bytes(),
            )
            .await;
            return;
        }

        let raw: RawProvisioningRequest = match serde_json::from_slice(body) {
            Ok(raw) => raw,
            Err(e) => {
                let invalid = InputError::MalformedDocument {
                    message: e.to_string(),
                };
                let _ = http::write_json(&mut write, 400, &json!({"error": invalid.to_string()}))
                    .await;
                return;
            }
        };
        let request = match ProvisioningRequest::validate(raw) {
            Ok(request) => request,
            Err(e) => {
                let _ =
                    http::write_json(&mut write, 400, &json!({"error": e.to_string()})).await;
                return;
            }
        };

        info!(
            request = %request.request_id,
            device = %request.device_id,
            client = %peer.ip(),
            stream = request.stream,
            "provisioning request admitted"
        );

        // The flag is registered with the coordinator so shutdown reaches
        // this request's supervisor
        let cancel = CancelFlag::new();
        let _guard = self
            .coordinator
            .register_request(request.request_id, cancel.clone());
        if request.stream {
            self.run_streaming(request, cancel, write).await;
        } else {
            self.run_sync(request, cancel, write).await;
        }
    }

    /// Synchronous mode: a single JSON result once the pipeline finishes
    async fn run_sync(
        &self,
        request: ProvisioningRequest,
        cancel: CancelFlag,
        mut write: OwnedWriteHalf,
    ) {
        let (tx, mut rx) = provd_events::channel();
        // Progress is produced regardless; discard it in sync mode
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let terminal = self.controller.run(&request, &tx, &cancel).await;
        drop(tx);
        let _ = drain.await;

        let body = serde_json::to_value(&terminal)
            .unwrap_or_else(|_| json!({"success": false, "error": "internal error"}));
        let _ = http::write_json(&mut write, 200, &body).await;
    }

    /// Streaming mode: NDJSON events, exactly one terminal, then close
    async fn run_streaming(
        &self,
        request: ProvisioningRequest,
        cancel: CancelFlag,
        mut write: OwnedWriteHalf,
    ) {
        if http::write_stream_head(&mut write).await.is_err() {
            return; // client vanished before we started
        }

        let (tx, mut rx) = provd_events::channel();

        let controller = self.controller.clone();
        let run_request = request.clone();
        let run_cancel = cancel.clone();
        let pipeline = tokio::spawn(async move {
            controller.run(&run_request, &tx, &run_cancel).await
        });

        let mut channel = ProgressChannel::new(&mut write, cancel.clone());
        while let Some(event) = rx.recv().await {
            // Keep draining after a write failure so the pipeline can
            // observe the cancellation and wind down
            let _ = channel.send(&event).await;
        }

        let terminal = match pipeline.await {
            Ok(terminal) => terminal,
            Err(e) => {
                warn!(request = %request.request_id, error = %e, "pipeline task failed");
                TerminalEvent::failure("internal error")
            }
        };
        let _ = channel.send(&StageEvent::Terminal(terminal)).await;
    }
}

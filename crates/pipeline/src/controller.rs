//! The pipeline controller
//!
//! Drives the planned stage list for one provisioning request: resolves the
//! image source against the cache, runs each stage executor through the
//! supervisor, rescales stage-local progress into the global range, and
//! resolves to exactly one request-level terminal event.

use crate::command::executor_command;
use crate::plan::{PlanInputs, PlannedStage, StagePlan};
use provd_cache::{CacheLease, CacheManager};
use provd_config::Config;
use provd_errors::Error;
use provd_events::{EventReceiver, EventSender, StageEvent, TerminalEvent};
use provd_hash::{cache_key, Hash};
use provd_supervisor::{CancelFlag, StageCommand, StageOutcome, Supervisor, SupervisorConfig};
use provd_types::{ImageSource, ProvisioningRequest, StageKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Executes provisioning requests end to end
#[derive(Clone)]
pub struct PipelineController {
    cache: Arc<CacheManager>,
    supervisor: Supervisor,
    config: Arc<Config>,
}

impl PipelineController {
    #[must_use]
    pub fn new(cache: Arc<CacheManager>, supervisor: Supervisor, config: Arc<Config>) -> Self {
        Self {
            cache,
            supervisor,
            config,
        }
    }

    /// Run one request to its terminal event
    ///
    /// Never returns an error: any internal failure is converted into a
    /// failure terminal at this boundary, so a request cannot end without
    /// an outcome. The caller owns delivery of the returned terminal.
    pub async fn run(
        &self,
        request: &ProvisioningRequest,
        events: &EventSender,
        cancel: &CancelFlag,
    ) -> TerminalEvent {
        match self.run_inner(request, events, cancel).await {
            Ok(terminal) => terminal,
            Err(e) if e.is_cancellation() => {
                debug!(request = %request.request_id, "provisioning cancelled");
                TerminalEvent::failure("provisioning cancelled")
            }
            Err(e) => {
                warn!(request = %request.request_id, error = %e, "provisioning failed");
                TerminalEvent::failure(e.to_string())
            }
        }
    }

    async fn run_inner(
        &self,
        request: &ProvisioningRequest,
        events: &EventSender,
        cancel: &CancelFlag,
    ) -> Result<TerminalEvent, Error> {
        self.emit(
            events,
            cancel,
            StageEvent::progress("Checking image cache", 0).with_stage(StageKind::CacheLookup),
        )
        .await;

        // Resolve the image source. A cache hit or local path yields the
        // image immediately; a download URL miss means a fresh fetch. A
        // client-supplied key is already the derived hash, so it is parsed
        // and used as-is rather than hashed again.
        let key = match &request.source {
            ImageSource::LocalPath(_) => None,
            ImageSource::CacheKey(raw) => match Hash::from_hex(raw) {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    return Ok(TerminalEvent::failure(format!(
                        "not a valid cache key: {raw}"
                    )))
                }
            },
            ImageSource::DownloadUrl(url) => Some(cache_key(url)),
        };

        let cached = match key.as_ref() {
            Some(key) => self.cache.lookup(key).await?,
            None => None,
        };

        let mut lease: Option<CacheLease> = None;
        let mut image_path: Option<PathBuf> = None;
        let mut download_url: Option<String> = None;

        match (&request.source, cached) {
            (ImageSource::LocalPath(path), _) => {
                if !path.exists() {
                    return Ok(TerminalEvent::failure(format!(
                        "local image not found: {}",
                        path.display()
                    )));
                }
                image_path = Some(path.clone());
            }
            (source, Some((entry, held))) => {
                info!(
                    request = %request.request_id,
                    locator = %source.locator(),
                    "image served from cache"
                );
                image_path = Some(entry.path);
                lease = Some(held);
            }
            (ImageSource::CacheKey(raw_key), None) => {
                return Ok(TerminalEvent::failure(format!(
                    "no cached image for key {raw_key}"
                )))
            }
            (ImageSource::DownloadUrl(url), None) => download_url = Some(url.clone()),
        }

        let fresh_download = download_url.is_some();
        let compressed = download_url
            .as_deref()
            .is_some_and(|url| url.ends_with(".gz"));
        let plan = StagePlan::build(PlanInputs {
            fresh_download,
            compressed,
            has_configuration: request.configuration.is_some(),
        });

        let workdir = tempfile::tempdir()?;
        let downloaded = workdir.path().join("image.download");
        let decompressed = workdir.path().join("image.raw");
        let mut config_warning: Option<String> = None;

        for stage in plan.iter() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let args = match stage.kind {
                StageKind::Download => {
                    let url = download_url
                        .clone()
                        .ok_or_else(|| Error::internal("download stage without a URL"))?;
                    vec![
                        "--url".to_string(),
                        url,
                        "--output".to_string(),
                        downloaded.display().to_string(),
                    ]
                }
                StageKind::Decompress => vec![
                    "--input".to_string(),
                    downloaded.display().to_string(),
                    "--output".to_string(),
                    decompressed.display().to_string(),
                ],
                StageKind::ChecksumVerify => {
                    // Register the fetched image in the cache first; the
                    // verify stage then re-reads the stored object against
                    // its recorded hash before it ever touches a device.
                    let source_file = if compressed { &decompressed } else { &downloaded };
                    let key = key
                        .as_ref()
                        .ok_or_else(|| Error::internal("fresh download without a cache key"))?;
                    let (entry, held) = self.cache.store(key, source_file, None).await?;
                    image_path = Some(entry.path.clone());
                    lease = Some(held);
                    self.evict_opportunistically().await;

                    vec![
                        "--path".to_string(),
                        entry.path.display().to_string(),
                        "--expected".to_string(),
                        entry.content_hash.to_hex(),
                    ]
                }
                StageKind::DeviceFormat => {
                    vec!["--device".to_string(), request.device_id.clone()]
                }
                StageKind::ImageWrite => {
                    let image = image_path
                        .as_ref()
                        .ok_or_else(|| Error::internal("write stage without an image"))?;
                    vec![
                        "--image".to_string(),
                        image.display().to_string(),
                        "--device".to_string(),
                        request.device_id.clone(),
                    ]
                }
                StageKind::PostInstallConfigure => {
                    let document = workdir.path().join("configuration.json");
                    let settings = request
                        .configuration
                        .as_ref()
                        .ok_or_else(|| Error::internal("configure stage without a document"))?;
                    tokio::fs::write(&document, serde_json::to_vec(settings)?)
                        .await
                        .map_err(|e| Error::io_with_path(&e, &document))?;
                    vec![
                        "--target".to_string(),
                        request.device_id.clone(),
                        "--document".to_string(),
                        document.display().to_string(),
                    ]
                }
                StageKind::CacheLookup => continue, // never planned as external
            };

            let command = executor_command(&self.config.stages, stage.kind, args)?;
            let outcome = self
                .run_stage(request, &command, *stage, events, cancel)
                .await?;

            if outcome.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if outcome.terminal.success {
                self.emit(
                    events,
                    cancel,
                    StageEvent::progress(
                        format!("{} complete", stage.kind),
                        stage.rescale(100),
                    )
                    .with_stage(stage.kind),
                )
                .await;
                continue;
            }

            // Configuration failure downgrades to a warning on an
            // otherwise successful install; everything else aborts.
            if stage.kind == StageKind::PostInstallConfigure {
                let reason = outcome
                    .terminal
                    .error
                    .unwrap_or_else(|| "configuration stage failed".to_string());
                warn!(request = %request.request_id, %reason, "configuration stage failed");
                config_warning = Some(reason);
                continue;
            }

            return Ok(outcome.terminal);
        }

        drop(lease);

        let terminal = TerminalEvent::success(format!(
            "Provisioning of {} complete",
            request.device_id
        ));
        Ok(match config_warning {
            Some(warning) => terminal.with_warning(warning),
            None => terminal,
        })
    }

    async fn run_stage(
        &self,
        request: &ProvisioningRequest,
        command: &StageCommand,
        stage: PlannedStage,
        events: &EventSender,
        cancel: &CancelFlag,
    ) -> Result<StageOutcome, Error> {
        let (stage_tx, stage_rx) = provd_events::channel();
        let forwarder = tokio::spawn(forward_rescaled(
            stage_rx,
            events.clone(),
            stage,
            cancel.clone(),
        ));

        let result = self
            .supervisor
            .run(
                request.request_id,
                command,
                &self.supervisor_config(stage.kind),
                &stage_tx,
                cancel,
            )
            .await;

        drop(stage_tx);
        let _ = forwarder.await;
        result
    }

    fn supervisor_config(&self, kind: StageKind) -> SupervisorConfig {
        let timeouts = &self.config.timeouts;
        let overall = match kind {
            // Long-running stages are bounded by the silence timeout only
            StageKind::Download | StageKind::Decompress | StageKind::ImageWrite => None,
            _ => Some(timeouts.quick_stage_timeout()),
        };
        SupervisorConfig {
            startup_grace: timeouts.startup_grace(),
            silence_timeout: timeouts.silence_timeout(),
            overall_timeout: overall,
            termination_grace: timeouts.termination_grace(),
            poll_interval: timeouts.poll_interval(),
            ..SupervisorConfig::default()
        }
    }

    async fn evict_opportunistically(&self) {
        let max_age = Duration::from_secs(u64::from(self.config.cache.max_age_days) * 86_400);
        match self
            .cache
            .evict(self.config.cache.max_total_bytes, max_age)
            .await
        {
            Ok(stats) if stats.evicted_by_age + stats.evicted_by_size > 0 => {
                debug!(
                    removed = stats.evicted_by_age + stats.evicted_by_size,
                    bytes = stats.bytes_freed,
                    "cache eviction after store"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache eviction failed"),
        }
    }

    /// Forward one controller-generated event; a refused send means the
    /// consumer is gone, which is a cancellation.
    async fn emit(&self, events: &EventSender, cancel: &CancelFlag, event: StageEvent) {
        if events.send(event).await.is_err() {
            cancel.cancel();
        }
    }
}

/// Forward stage events to the request channel, rescaling progress into
/// the stage's global percent range
async fn forward_rescaled(
    mut rx: EventReceiver,
    events: EventSender,
    stage: PlannedStage,
    cancel: CancelFlag,
) {
    while let Some(event) = rx.recv().await {
        let event = match event {
            StageEvent::Progress(mut p) => {
                p.percent = stage.rescale(p.percent);
                StageEvent::Progress(p)
            }
            other => other,
        };
        if events.send(event).await.is_err() {
            cancel.cancel();
            break;
        }
    }
}

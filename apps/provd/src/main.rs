//! provd - device image provisioning daemon
//!
//! One binary, two faces: `provd serve` runs the supervising server, and
//! the hidden `provd stage <kind>` subcommands are the built-in stage
//! executors the server spawns as children. Keeping both in one binary
//! means the wire contract between them can never skew across versions.

mod cli;

use crate::cli::{Cli, Commands, StageCommands};
use clap::Parser;
use provd_cache::CacheManager;
use provd_config::Config;
use provd_errors::Error;
use provd_server::{Server, ShutdownCoordinator, ShutdownReason};
use provd_stages::StageJob;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Stage(stage) => {
            // Stdout belongs to the wire protocol; keep logging quiet and
            // on stderr, where the supervisor treats it as diagnostics.
            init_tracing(cli.global.log_json, "warn");
            let code = provd_stages::run(stage_job(stage)).await;
            process::exit(code);
        }
        Commands::Serve { listen, cache_dir } => {
            init_tracing(cli.global.log_json, "info");
            if let Err(e) = serve(&cli.global, listen, cache_dir).await {
                error!(error = %e, "server failed");
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    }
}

/// Load configuration, bind, and run the server until shutdown
async fn serve(
    global: &cli::GlobalArgs,
    listen: Option<String>,
    cache_dir: Option<std::path::PathBuf>,
) -> Result<(), Error> {
    info!("starting provd v{}", env!("CARGO_PKG_VERSION"));

    // Precedence: defaults, then file, then environment, then CLI flags
    let mut config = Config::load_or_default(global.config.as_deref()).await?;
    config.merge_env()?;
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(dir) = cache_dir {
        config.cache.directory = dir;
    }

    let cache = Arc::new(
        CacheManager::open(&config.cache.directory, config.cache.verify_on_lookup).await?,
    );
    let server = Arc::new(Server::new(Arc::new(config), cache));
    let listener = server.bind().await?;

    spawn_signal_watchers(Arc::clone(server.coordinator()))?;

    server.serve(listener).await?;
    info!("provd stopped");
    Ok(())
}

/// Route SIGINT and SIGTERM into a graceful shutdown
fn spawn_signal_watchers(coordinator: Arc<ShutdownCoordinator>) -> Result<(), Error> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let signo = tokio::select! {
            _ = interrupt.recv() => SIGINT,
            _ = terminate.recv() => SIGTERM,
        };
        info!(signo, "shutdown signal received");
        if !coordinator.begin_shutdown(ShutdownReason::Signal(signo)) {
            warn!("shutdown already in progress");
        }
    });
    Ok(())
}

fn stage_job(stage: StageCommands) -> StageJob {
    match stage {
        StageCommands::Download {
            url,
            output,
            expected,
        } => StageJob::Download {
            url,
            output,
            expected_hash: expected,
        },
        StageCommands::Decompress { input, output } => StageJob::Decompress { input, output },
        StageCommands::ChecksumVerify { path, expected } => StageJob::Verify {
            path,
            expected_hash: expected,
        },
        StageCommands::DeviceFormat { device } => StageJob::Format { device },
        StageCommands::ImageWrite { image, device } => StageJob::Write { image, device },
        StageCommands::PostInstallConfigure { target, document } => {
            StageJob::Configure { target, document }
        }
    }
}

/// Initialize tracing to stderr
///
/// `RUST_LOG` overrides the mode default either way.
fn init_tracing(json: bool, default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
}

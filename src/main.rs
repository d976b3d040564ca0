//! `boardwatch` daemon entry point.
//!
//! Configured through `BOARDWATCH_CONFIG` and `BOARDWATCH_*` variables; log
//! verbosity through `RUST_LOG` (default `boardwatch=info`).

use std::process::ExitCode;

use boardwatch::{Config, FileLogArchive, FileRotator, SerialTransport, Supervisor};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("boardwatch=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Config) -> boardwatch::Result<()> {
    let transport = SerialTransport::new(config.serial_config());
    let archive = FileLogArchive::new(&config.jobs.archive_path);
    let rotator = FileRotator::new(&config.jobs.archive_path, config.jobs.keep_generations);

    let mut supervisor = Supervisor::new(transport, config.supervisor_config()?, archive)
        .with_rotation(rotator)
        .with_probe(config.ping_probe())
        .with_host(config.shutdown_host());
    if let Some(handoff) = config.handoff() {
        supervisor = supervisor.with_handoff(handoff);
    }

    supervisor.run().await
}

fn main() -> ExitCode {
    init_tracing();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(dir) = config.jobs.archive_path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("cannot create {}: {}", dir.display(), e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("boardwatch {} starting", env!("CARGO_PKG_VERSION"));
    match runtime.block_on(run(config)) {
        Ok(()) => {
            tracing::info!("host shutdown issued, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

use graceful_echo::config::Config;
use graceful_echo::runtime::{self, ShutdownCoordinator, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> graceful_echo::Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        mode = ?config.session_mode,
        read_chunk_size = config.read_chunk_size,
        drain_timeout_ms = config.drain_timeout.as_millis() as u64,
        "Starting graceful-echo server"
    );

    let mut coordinator = ShutdownCoordinator::new(config.drain_timeout);
    coordinator.install(&[Signal::Interrupt, Signal::Terminate])?;

    let report = runtime::run(&config, &coordinator).inspect_err(|e| {
        error!(error = %e, "Server failed");
    })?;

    info!(
        finished = report.finished,
        cancelled = report.cancelled,
        "Server stopped"
    );
    Ok(())
}

//! line-echo server entry point.

use line_echo::config::{Config, RuntimeType};
use line_echo::{blocking, runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        host = %config.host,
        port = config.port,
        runtime = ?config.runtime,
        workers = config.workers,
        max_line = config.max_line,
        idle_timeout_ms = config.idle_timeout.as_millis() as u64,
        "Starting line-echo server"
    );

    match config.runtime {
        RuntimeType::EventLoop => runtime::run(&config)?,
        RuntimeType::Blocking => blocking::run(&config)?,
    }

    Ok(())
}

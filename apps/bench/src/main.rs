//! tracebench client entry point.

mod app;
mod config;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting tracebench");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::Config::load(path.as_deref())?;
    tracing::info!(
        peer = %config.peer_addr(),
        trace = %config.trace_path,
        source = %config.source_dir,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("run finished");
    Ok(())
}

pub mod archive;
pub mod backup;
pub mod config;
mod error;
pub mod host;
pub mod metrics;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod scheduler;
pub mod sleep;
mod validation;

use tracing_subscriber::EnvFilter;

pub use error::{AppError, ErrorKind, Result};
pub use host::{Host, HostSnapshot};

#[allow(clippy::expect_used)]
pub fn run() {
    init_logging();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = runtime.block_on(serve()) {
        log::error!("gamehost exited with error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve() -> Result<()> {
    let root = paths::default_data_dir()?;
    let host = Host::boot(root).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    host.shutdown().await;
    Ok(())
}

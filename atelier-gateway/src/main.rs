//! Atelier Gateway - Main entry point.

use anyhow::Result;
use atelier_common::config::Config;
use atelier_common::logging::init_logging_with_exclusions;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (file, then environment)
    let config = Config::load_with_env()?;

    init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );

    tracing::info!("Atelier Gateway v{}", env!("CARGO_PKG_VERSION"));

    atelier_gateway::start_server(&config).await
}

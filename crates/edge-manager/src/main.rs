//! Edge manager binary

use edge_manager::{Config, EdgeManagerServer, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing is configured from the file, so report load errors on stderr
    let loaded = match Config::load() {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            None
        }
    };
    let using_defaults = loaded.is_none();
    let config = loaded.unwrap_or_default();

    let _telemetry_guard = init_tracing(&config.logging, &config.telemetry)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Edge manager starting");
    if using_defaults {
        tracing::warn!("Using default configuration");
    }

    EdgeManagerServer::new(config).run().await?;

    Ok(())
}

//! Standalone edge manager process.

use crate::config::Config;
use crate::http_server::MetricsServer;
use crate::manager::Manager;
use crate::memory::MemoryBackends;
use crate::metrics::MetricsRegistry;
use common::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wires in-memory backends, the metrics endpoint and the [`Manager`], then
/// runs until SIGINT or SIGTERM.
pub struct EdgeManagerServer {
    config: Config,
}

impl EdgeManagerServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting edge manager");

        let metrics = if self.config.metrics.enabled {
            info!("Metrics enabled on {}", self.config.metrics.listen_addr);
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        let backends = MemoryBackends::new();
        for task in &self.config.tasks {
            backends.tasks.insert(task.clone());
        }
        info!(tasks = backends.tasks.len(), "Task store seeded from configuration");

        let manager = Manager::new(&self.config, backends.services(), metrics.clone())?;
        let shutdown = CancellationToken::new();

        let metrics_handle = metrics.map(|registry| {
            let server = MetricsServer::new(registry, self.config.metrics.listen_addr.clone());
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    warn!(error = %e, "Metrics server error");
                }
            })
        });

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            signal_token.cancel();
        });

        let result = manager.start(&shutdown).await;
        shutdown.cancel();

        if let Some(handle) = metrics_handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Metrics server task failed");
        }

        info!("Edge manager stopped");
        result
    }
}

/// Resolves on Ctrl-C or SIGTERM. Never resolves if no handler installs.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received, shutting down");
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// src/main.rs
//! Resource Orchestrator
//!
//! Builds every pool from configuration and serves the health surface until
//! Ctrl-C. Usage: `resource-orchestrator [config-file]`

use anyhow::{Context, Result};
use resource_orchestrator::health::{HealthAggregator, HealthServer};
use resource_orchestrator::observability::{init_metrics, init_tracing};
use resource_orchestrator::subsystems::{
    ApiClientPool, BrowserPool, FileManager, NetworkCoordinator, ProcessManager,
};
use resource_orchestrator::utils::config::OrchestratorConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let config = OrchestratorConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    init_metrics()?;

    info!("Starting Resource Orchestrator v{}", resource_orchestrator::VERSION);
    info!("Configuration loaded: {:?}", config);

    let shutdown = CancellationToken::new();

    let api = Arc::new(ApiClientPool::from_config(&config.api)?);
    let files = Arc::new(FileManager::from_config(&config.file));
    let browsers = Arc::new(BrowserPool::from_config(&config.browser));
    let processes = Arc::new(ProcessManager::from_config(&config.process, shutdown.clone()));
    let network = Arc::new(NetworkCoordinator::from_config(&config.network));

    let aggregator = HealthAggregator::from_config(&config.health)
        .with_api_pool(Arc::clone(&api))
        .with_file_manager(Arc::clone(&files))
        .with_browser_pool(Arc::clone(&browsers))
        .with_process_manager(Arc::clone(&processes))
        .with_network_coordinator(Arc::clone(&network));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid server address {}:{}", config.server.host, config.server.port))?;

    let server = Arc::new(HealthServer::new(aggregator));
    let mut server_task = tokio::spawn(server.start(addr, shutdown.clone()));

    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to install Ctrl-C handler")?;
            info!("Received shutdown signal, cleaning up...");
            None
        }
        result = &mut server_task => Some(result),
    };
    shutdown.cancel();

    let result = match stopped_early {
        Some(result) => result,
        None => server_task.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Health server error: {}", e),
        Err(e) => error!("Health server task failed: {}", e),
    }

    api.close()?;
    files.close()?;
    network.close()?;
    browsers.close().await?;
    processes.close().await?;

    info!("Shutdown complete");
    Ok(())
}

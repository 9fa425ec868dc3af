mod api;
mod config;
mod health_monitor;
mod port_allocator;
mod process_monitor;
mod service;
mod supervisor;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Warden starting");

    let cfg = config::WardenConfig::load();
    tracing::info!("Using registry file: {}", cfg.registry_path.display());

    let listen_addr = cfg.listen_addr.clone();
    let health_interval = cfg.health_interval();
    let supervisor = Arc::new(supervisor::Supervisor::new(cfg)?);

    // Health monitor task; cancelled first on shutdown so no restart races
    // the teardown of the children.
    let shutdown = CancellationToken::new();
    let monitor = health_monitor::HealthMonitor::new(
        supervisor.clone(),
        health_interval,
        shutdown.clone(),
    );
    let monitor_task = tokio::spawn(monitor.run());

    // Graceful shutdown: stop the monitor, then every child, then exit.
    {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received, cleaning up");
            shutdown.cancel();
            let _ = monitor_task.await;
            supervisor.shutdown_all().await;
            tracing::info!("Cleanup complete, exiting");
            std::process::exit(0);
        });
    }

    tracing::info!("Starting enabled services");
    supervisor.start_enabled_services().await;

    let server = api::ApiServer::new(supervisor, &listen_addr);
    if let Err(e) = server.start().await {
        tracing::error!("Control API error: {}", e);
    }

    tracing::info!("Warden shutting down");
    Ok(())
}

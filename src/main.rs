use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use socks5d::dns::Resolver;
use socks5d::graceful_shutdown::GracefulShutdown;
use socks5d::http_server::HttpServer;
use socks5d::metrics::ProxyMetrics;
use socks5d::{server, Cli, ProxyConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match ProxyConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(config).await {
        error!("proxy exited with error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = Arc::new(Resolver::connect(config.dns_upstream).await?);
    let metrics = Arc::new(ProxyMetrics::new()?);
    let shutdown = Arc::new(GracefulShutdown::new());

    let mut tasks = Vec::new();

    if let Some(metrics_addr) = config.metrics_addr {
        let http_server = HttpServer::new(metrics.clone(), metrics_addr);
        let http_shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http_server.start(http_shutdown_rx).await {
                error!("HTTP server failed: {e}");
            }
        }));
    }

    let listener_shutdown_rx = shutdown.subscribe();
    let listener_config = config.clone();
    let listener_resolver = resolver.clone();
    let listener_metrics = metrics.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = server::run(
            listener_config,
            listener_resolver,
            listener_metrics,
            listener_shutdown_rx,
        )
        .await
        {
            error!("listener failed: {e}");
        }
    });

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received, shutting down");

    shutdown.shutdown().await?;
    listener_task.await?;
    for task in tasks {
        task.await?;
    }

    Ok(())
}

/// Waits for either Ctrl-C or SIGTERM, whichever arrives first.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

//! VMess node agent entry point

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;

use vmess_node::config::{CliArgs, PanelConfig, ServiceConfig};
use vmess_node::logger::{self, log};
use vmess_node::panel::HttpPanelClient;
use vmess_node::proxy::{ClosingInbound, ProxyController};
use vmess_node::{NodeService, Service};

#[tokio::main]
async fn main() -> Result<()> {
    // Ring is the only provider compiled in; a second install is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(cli.log_mode);

    log::info!(
        api = %cli.api,
        node = cli.node,
        version = env!("CARGO_PKG_VERSION"),
        "Starting VMess node"
    );

    let panel = Arc::new(HttpPanelClient::new(PanelConfig::from_cli(&cli))?);
    let config = ServiceConfig::from_cli(&cli);
    let proxy = Arc::new(ProxyController::new(
        config.listener,
        Arc::new(ClosingInbound),
    ));

    let mut service = NodeService::new(cli.node, config, panel, proxy);
    if let Err(e) = service.start().await {
        log::error!(node = cli.node, error = %e, "Failed to start node service");
        if let Err(close_err) = service.close().await {
            log::warn!(error = %close_err, "Cleanup after failed start");
        }
        return Err(e.into());
    }

    wait_for_shutdown().await?;

    service.close().await?;
    log::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

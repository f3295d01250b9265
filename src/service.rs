//! Node service lifecycle

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cert::CertStore;
use crate::config::ServiceConfig;
use crate::error::{NodeError, Result};
use crate::logger::log;
use crate::panel::{NodeConfig, PanelClient};
use crate::proxy::ProxyControl;
use crate::sync::{SchedulerHandle, SyncScheduler};

/// A long-running component with an explicit start/close lifecycle
#[async_trait]
pub trait Service: Send {
    async fn start(&mut self) -> Result<()>;

    /// Release everything `start` acquired; safe to call more than once
    async fn close(&mut self) -> Result<()>;
}

/// Wires the panel, the proxy controller and the sync scheduler together
pub struct NodeService {
    node_id: u32,
    config: ServiceConfig,
    panel: Arc<dyn PanelClient>,
    proxy: Arc<dyn ProxyControl>,
    shutdown: CancellationToken,
    certs: Option<CertStore>,
    node: Option<NodeConfig>,
    scheduler: Option<SchedulerHandle>,
    proxy_started: bool,
}

impl NodeService {
    pub fn new(
        node_id: u32,
        config: ServiceConfig,
        panel: Arc<dyn PanelClient>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            node_id,
            config,
            panel,
            proxy,
            shutdown: CancellationToken::new(),
            certs: None,
            node: None,
            scheduler: None,
            proxy_started: false,
        }
    }

    /// Inbound descriptor fetched at start
    pub fn node_config(&self) -> Option<&NodeConfig> {
        self.node.as_ref()
    }

    pub fn cert_store(&self) -> Option<&CertStore> {
        self.certs.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.proxy_started
    }
}

#[async_trait]
impl Service for NodeService {
    async fn start(&mut self) -> Result<()> {
        if self.proxy_started {
            return Err(NodeError::Config("node service already started".into()));
        }

        let certs = CertStore::load(&self.config.cert)?;
        log::debug!(cert_file = %self.config.cert.cert_file.display(), "TLS material loaded");

        let node = self.panel.fetch_node_config().await?;
        log::info!(
            node_id = self.node_id,
            protocol = node.protocol(),
            port = node.server_port,
            transport = %node.transport,
            tls = node.tls,
            "Node configuration fetched"
        );

        self.proxy.start(&node, &certs).await?;
        self.proxy_started = true;

        let scheduler = Arc::new(SyncScheduler::new(
            self.node_id,
            self.config.sync_interval,
            Arc::clone(&self.panel),
            Arc::clone(&self.proxy),
        ));

        // Users failing to load here are picked up by the first tick
        match scheduler.sync_users().await {
            Ok(report) => log::info!(
                node_id = self.node_id,
                added = report.added,
                failed = report.failed,
                "Initial users loaded"
            ),
            Err(e) => log::warn!(
                node_id = self.node_id,
                operation = "fetch_users",
                error = %e,
                "Initial user sync failed"
            ),
        }

        self.scheduler = Some(scheduler.spawn(self.shutdown.child_token()));
        self.certs = Some(certs);
        self.node = Some(node);
        log::info!(node_id = self.node_id, "Node service started");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Scheduler first so its final report runs against a live proxy
        if let Some(handle) = self.scheduler.take() {
            if !handle.shutdown(self.config.close_timeout).await {
                log::warn!(node_id = self.node_id, "Sync scheduler did not stop in time");
            }
        }

        if self.proxy_started {
            self.proxy_started = false;
            self.proxy.stop().await?;
            log::info!(node_id = self.node_id, "Node service closed");
        }
        Ok(())
    }
}

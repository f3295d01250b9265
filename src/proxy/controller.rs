//! Proxy controller: inbound listener lifecycle and user-set management

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionManager;
use super::hooks::{InboundHandler, Session, TransportStream, UserId};
use super::registry::UserRegistry;
use super::stats::{TrafficCollector, TrafficRecord};
use super::ProxyControl;
use crate::cert::CertStore;
use crate::config::ListenerConfig;
use crate::error::{NodeError, Result};
use crate::logger::log;
use crate::panel::{AuthorizedUser, NodeConfig, Transport};

/// Address the inbound binds on
const BIND_HOST: &str = "0.0.0.0";

/// TCP keepalive interval; dead peers are detected in ~45s (3 probes)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// How long `stop()` waits for the accept loop to exit
const ACCEPT_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningInbound {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Shared state every connection task needs
struct InboundContext {
    handler: Arc<dyn InboundHandler>,
    registry: Arc<UserRegistry>,
    traffic: Arc<TrafficCollector>,
    connections: ConnectionManager,
    transport: Transport,
    tls: Option<TlsAcceptor>,
    listener: ListenerConfig,
}

/// Owns the inbound listener and the active user set
pub struct ProxyController {
    listener_config: ListenerConfig,
    handler: Arc<dyn InboundHandler>,
    registry: Arc<UserRegistry>,
    traffic: Arc<TrafficCollector>,
    connections: ConnectionManager,
    running: Mutex<Option<RunningInbound>>,
}

impl ProxyController {
    pub fn new(listener_config: ListenerConfig, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            listener_config,
            handler,
            registry: Arc::new(UserRegistry::new()),
            traffic: Arc::new(TrafficCollector::new()),
            connections: ConnectionManager::new(),
            running: Mutex::new(None),
        }
    }

    /// Bound address while started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    pub fn traffic(&self) -> &Arc<TrafficCollector> {
        &self.traffic
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    fn bind(&self, port: u16) -> Result<TcpListener> {
        let addr = format!("{}:{}", BIND_HOST, port);
        let bind_err = |source: std::io::Error| NodeError::Bind {
            addr: addr.clone(),
            source,
        };

        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| NodeError::Config(format!("invalid listen address {}: {}", addr, e)))?;
        let domain = match socket_addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        // Allow immediate rebind after restart (skip TIME_WAIT)
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&socket_addr.into()).map_err(bind_err)?;
        socket
            .listen(self.listener_config.tcp_backlog)
            .map_err(bind_err)?;

        TcpListener::from_std(socket.into()).map_err(bind_err)
    }
}

#[async_trait]
impl ProxyControl for ProxyController {
    async fn start(&self, node: &NodeConfig, certs: &CertStore) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(NodeError::Config("inbound is already started".into()));
        }

        let tls = node
            .tls
            .then(|| certs.acceptor(node.transport.alpn()));

        let listener = self.bind(node.server_port)?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(InboundContext {
            handler: Arc::clone(&self.handler),
            registry: Arc::clone(&self.registry),
            traffic: Arc::clone(&self.traffic),
            connections: self.connections.clone(),
            transport: node.transport.clone(),
            tls,
            listener: self.listener_config,
        });
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        log::info!(
            address = %local_addr,
            protocol = node.protocol(),
            transport = %node.transport,
            tls = node.tls,
            "Inbound started"
        );

        *running = Some(RunningInbound {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(inbound) = self.running.lock().await.take() else {
            log::debug!("Inbound already stopped");
            return Ok(());
        };

        // Cancels the accept loop and, through child tokens, every connection
        inbound.shutdown.cancel();
        match tokio::time::timeout(ACCEPT_LOOP_JOIN_TIMEOUT, inbound.accept_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!(error = %e, "Accept loop panicked"),
            Err(_) => log::warn!("Accept loop did not exit in time"),
        }

        let kicked = self.connections.kick_all();
        let users = self.registry.len();
        self.registry.clear();

        log::info!(
            address = %inbound.local_addr,
            users = users,
            kicked = kicked,
            "Inbound stopped"
        );
        Ok(())
    }

    async fn add_user(&self, user: AuthorizedUser) -> Result<()> {
        let user_id = user.id;
        self.registry.add(user)?;
        log::debug!(user_id = user_id, "User added");
        Ok(())
    }

    async fn remove_user(&self, user_id: UserId) -> Result<()> {
        self.registry.remove(user_id)?;
        let kicked = self.connections.kick_user(user_id);
        log::debug!(user_id = user_id, kicked = kicked, "User removed");
        Ok(())
    }

    async fn active_users(&self) -> Vec<UserId> {
        self.registry.ids()
    }

    async fn snapshot_traffic(&self) -> HashMap<UserId, TrafficRecord> {
        self.traffic.snapshot_and_reset()
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<InboundContext>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                log::connection(&peer_addr.to_string(), "new");
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(&ctx, stream, peer_addr, shutdown).await {
                        log::debug!(peer = %peer_addr, error = %e, "Connection error");
                    }
                    log::connection(&peer_addr.to_string(), "closed");
                });
            }
            Err(e) => {
                // Per-connection failures (e.g. EMFILE, aborted handshakes) must
                // not take the listener down
                log::error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(
    ctx: &InboundContext,
    stream: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if ctx.listener.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    let stream: TransportStream = match &ctx.tls {
        Some(acceptor) => {
            match tokio::time::timeout(ctx.listener.tls_handshake_timeout, acceptor.accept(stream))
                .await
            {
                Ok(Ok(tls_stream)) => Box::pin(tls_stream),
                Ok(Err(e)) => return Err(anyhow::anyhow!("TLS handshake failed: {}", e)),
                Err(_) => return Err(anyhow::anyhow!("TLS handshake timeout")),
            }
        }
        None => Box::pin(stream),
    };

    let session = Session {
        peer_addr,
        transport: ctx.transport.clone(),
        authenticator: ctx.registry.clone(),
        stats: ctx.traffic.clone(),
        connections: ctx.connections.clone(),
        shutdown: shutdown.clone(),
    };

    tokio::select! {
        result = ctx.handler.handle(stream, session) => result,
        _ = shutdown.cancelled() => Ok(()),
    }
}

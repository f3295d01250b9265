//! Hook traits for the protocol engine
//!
//! The engine (VMess framing, encryption, transport codecs) is plugged in
//! through [`InboundHandler`]; the controller hands it every accepted stream
//! together with a [`Session`] giving access to authentication, traffic
//! accounting and per-user connection tracking.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionGuard, ConnectionManager};
use crate::logger::log;
use crate::panel::Transport;

/// User ID type used throughout the system, as issued by the panel.
pub type UserId = i64;

/// Unified transport stream trait combining AsyncRead + AsyncWrite + Send + Unpin
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Accepted inbound stream, TLS already terminated when enabled
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

/// Resolves a client credential to the owning user.
///
/// Synchronous: this is a hash-table lookup, not I/O.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, uuid: &str) -> Option<UserId>;
}

/// Statistics collector trait for traffic tracking
pub trait StatsCollector: Send + Sync {
    /// Record a proxy request
    fn record_request(&self, user_id: UserId);
    /// Record upload bytes (client -> remote)
    fn record_upload(&self, user_id: UserId, bytes: u64);
    /// Record download bytes (remote -> client)
    fn record_download(&self, user_id: UserId, bytes: u64);
}

/// Protocol engine entry point, called once per accepted connection
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, stream: TransportStream, session: Session) -> anyhow::Result<()>;
}

/// Per-connection context handed to the engine
#[derive(Clone)]
pub struct Session {
    pub peer_addr: SocketAddr,
    pub transport: Transport,
    pub authenticator: Arc<dyn Authenticator>,
    pub stats: Arc<dyn StatsCollector>,
    pub connections: ConnectionManager,
    /// Cancelled when the inbound is stopped
    pub shutdown: CancellationToken,
}

impl Session {
    /// Authenticate a credential and, on success, track the connection
    /// under the user so it can be kicked when the user is removed.
    pub fn login(&self, uuid: &str) -> Option<ConnectionGuard> {
        let Some(user_id) = self.authenticator.authenticate(uuid) else {
            log::debug!(peer = %self.peer_addr, "Authentication failed");
            return None;
        };
        self.stats.record_request(user_id);
        Some(
            self.connections
                .register(user_id, self.peer_addr.to_string(), &self.shutdown),
        )
    }
}

/// Handler that closes every connection immediately.
///
/// Used when no protocol engine is linked into the binary.
#[derive(Debug, Default)]
pub struct ClosingInbound;

#[async_trait]
impl InboundHandler for ClosingInbound {
    async fn handle(&self, _stream: TransportStream, session: Session) -> anyhow::Result<()> {
        log::debug!(
            peer = %session.peer_addr,
            transport = %session.transport,
            "No protocol engine linked, closing connection"
        );
        Ok(())
    }
}

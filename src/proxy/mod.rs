//! Proxy controller module
//!
//! This module wraps the proxy engine:
//! - Inbound listener lifecycle (bind, TLS, accept loop, stop)
//! - Active user set shared with connection tasks
//! - Per-user traffic counters
//! - Hook traits the protocol engine plugs into

mod connection;
mod controller;
pub mod hooks;
mod registry;
mod stats;

pub use connection::{ConnectionGuard, ConnectionManager};
pub use controller::ProxyController;
pub use hooks::{ClosingInbound, InboundHandler, Session, UserId};
pub use registry::UserRegistry;
pub use stats::{TrafficCollector, TrafficRecord};

use async_trait::async_trait;
use std::collections::HashMap;

use crate::cert::CertStore;
use crate::error::Result;
use crate::panel::{AuthorizedUser, NodeConfig};

/// Control surface of the proxy engine.
///
/// Every method is safe to call while connections are being served.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Bind the inbound listener; `Bind` on failure
    async fn start(&self, node: &NodeConfig, certs: &CertStore) -> Result<()>;

    /// Release the listener and all per-user state; idempotent
    async fn stop(&self) -> Result<()>;

    /// `DuplicateUser` if the id is already active
    async fn add_user(&self, user: AuthorizedUser) -> Result<()>;

    /// `UnknownUser` if the id is not active
    async fn remove_user(&self, user_id: UserId) -> Result<()>;

    /// Active user ids in ascending order
    async fn active_users(&self) -> Vec<UserId>;

    /// Read and zero all traffic counters atomically
    async fn snapshot_traffic(&self) -> HashMap<UserId, TrafficRecord>;
}

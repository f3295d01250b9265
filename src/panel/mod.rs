//! Remote panel integration
//!
//! This module handles:
//! - Node configuration fetching (once, at boot)
//! - Authorized user fetching (every cycle)
//! - Traffic reporting

mod client;
mod models;

pub use client::HttpPanelClient;
pub use models::{parse_users, AuthorizedUser, NodeConfig, Transport, UserTraffic, PROTOCOL};

use async_trait::async_trait;

use crate::error::Result;

/// Typed contract of the panel API
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Fetch the inbound descriptor; fails with `ConfigUnavailable`
    async fn fetch_node_config(&self) -> Result<NodeConfig>;

    /// Fetch the current authorized users; fails with `TransientFetch`
    async fn fetch_users(&self) -> Result<Vec<AuthorizedUser>>;

    /// Push traffic counters; fails with `Report`
    async fn report_traffic(&self, traffic: &[UserTraffic]) -> Result<()>;
}

//! Panel data model: node configuration, authorized users, traffic reports

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{NodeError, Result};
use crate::proxy::{TrafficRecord, UserId};

/// Inbound protocol served by this node
pub const PROTOCOL: &str = "vmess";

/// Default gRPC service name (Xray compatible)
pub const DEFAULT_GRPC_SERVICE_NAME: &str = "GunService";

/// Default WebSocket / HTTP2 path (Xray compatible)
pub const DEFAULT_PATH: &str = "/";

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP_1_1: &[u8] = b"http/1.1";

/// Transport of the inbound, with its settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws { path: String, host: Option<String> },
    H2 { path: String, host: Option<String> },
    Grpc { service_name: String },
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws { .. } => "ws",
            Transport::H2 { .. } => "h2",
            Transport::Grpc { .. } => "grpc",
        }
    }

    /// ALPN protocols to advertise when the inbound runs over TLS
    pub fn alpn(&self) -> &'static [&'static [u8]] {
        match self {
            Transport::Ws { .. } => &[ALPN_HTTP_1_1],
            Transport::H2 { .. } => &[ALPN_H2],
            Transport::Tcp | Transport::Grpc { .. } => &[ALPN_H2, ALPN_HTTP_1_1],
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inbound descriptor fetched from the panel once per boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub server_port: u16,
    pub transport: Transport,
    pub tls: bool,
}

impl NodeConfig {
    pub fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    /// Parse the panel's config body. Unknown fields are ignored.
    pub fn from_json(raw: &str) -> Result<Self> {
        let raw: RawNodeConfig = serde_json::from_str(raw)
            .map_err(|e| NodeError::ConfigUnavailable(format!("malformed node config: {}", e)))?;
        raw.try_into()
    }
}

#[derive(Debug, Deserialize)]
struct RawNodeConfig {
    server_port: Option<u16>,
    network: Option<String>,
    #[serde(default, alias = "networkSettings")]
    network_settings: Option<RawNetworkSettings>,
    /// v2board sends 0/1, some forks send a bool
    #[serde(default)]
    tls: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetworkSettings {
    path: Option<String>,
    host: Option<String>,
    #[serde(alias = "serviceName")]
    service_name: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl RawNetworkSettings {
    fn host(&self) -> Option<String> {
        self.host
            .clone()
            .or_else(|| self.headers.get("Host").cloned())
            .filter(|h| !h.is_empty())
    }

    fn path(&self) -> String {
        self.path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PATH.to_string())
    }
}

impl TryFrom<RawNodeConfig> for NodeConfig {
    type Error = NodeError;

    fn try_from(raw: RawNodeConfig) -> Result<Self> {
        let server_port = raw
            .server_port
            .filter(|p| *p != 0)
            .ok_or_else(|| NodeError::ConfigUnavailable("missing server_port".into()))?;

        let settings = raw.network_settings.unwrap_or_default();
        let network = raw.network.as_deref().unwrap_or("tcp").to_lowercase();
        let transport = match network.as_str() {
            "tcp" | "" => Transport::Tcp,
            "ws" | "websocket" => Transport::Ws {
                path: settings.path(),
                host: settings.host(),
            },
            "h2" | "http" => Transport::H2 {
                path: settings.path(),
                host: settings.host(),
            },
            "grpc" => Transport::Grpc {
                service_name: settings
                    .service_name
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_GRPC_SERVICE_NAME.to_string()),
            },
            other => {
                return Err(NodeError::ConfigUnavailable(format!(
                    "unsupported network: {}",
                    other
                )))
            }
        };

        let tls = match raw.tls {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Bool(b)) => b,
            Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(serde_json::Value::String(s)) => matches!(s.as_str(), "1" | "tls" | "true"),
            Some(other) => {
                return Err(NodeError::ConfigUnavailable(format!(
                    "invalid tls flag: {}",
                    other
                )))
            }
        };

        Ok(Self {
            server_port,
            transport,
            tls,
        })
    }
}

/// A user permitted to use the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub id: UserId,
    pub uuid: String,
    #[serde(default)]
    pub alter_id: u16,
    /// Informational; passed through to the engine, not enforced here
    #[serde(default, alias = "transfer_enable")]
    pub traffic_quota: Option<u64>,
}

impl AuthorizedUser {
    pub fn new(id: UserId, uuid: impl Into<String>) -> Self {
        Self {
            id,
            uuid: uuid.into(),
            alter_id: 0,
            traffic_quota: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    users: Vec<AuthorizedUser>,
}

/// Parse the panel's user list body
pub fn parse_users(raw: &str) -> Result<Vec<AuthorizedUser>> {
    let response: UsersResponse = serde_json::from_str(raw)
        .map_err(|e| NodeError::TransientFetch(format!("malformed users response: {}", e)))?;
    Ok(response.users)
}

/// Per-user traffic entry as pushed to the panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub user_id: UserId,
    /// Upload bytes
    pub u: u64,
    /// Download bytes
    pub d: u64,
    /// Connection count
    #[serde(default)]
    pub n: u64,
}

impl UserTraffic {
    pub fn from_record(user_id: UserId, record: &TrafficRecord) -> Self {
        Self {
            user_id,
            u: record.upload,
            d: record.download,
            n: record.requests,
        }
    }
}

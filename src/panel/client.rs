//! HTTP client for the v2board "UniProxy" panel API

use async_trait::async_trait;
use reqwest::StatusCode;

use super::models::{parse_users, AuthorizedUser, NodeConfig, UserTraffic, PROTOCOL};
use super::PanelClient;
use crate::config::PanelConfig;
use crate::error::{NodeError, Result};
use crate::logger::log;

const API_PREFIX: &str = "/api/v1/server/UniProxy";

/// Longest response body echoed into an error message
const MAX_ERROR_BODY: usize = 256;

/// Panel client over authenticated HTTP(S)
pub struct HttpPanelClient {
    http: reqwest::Client,
    config: PanelConfig,
}

impl HttpPanelClient {
    /// Create a new panel client
    pub fn new(config: PanelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .user_agent(concat!("vmess-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NodeError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn panel_config(&self) -> &PanelConfig {
        &self.config
    }

    fn url(&self, action: &str) -> String {
        format!("{}{}/{}", self.config.api_host, API_PREFIX, action)
    }

    fn query(&self) -> [(&'static str, String); 2] {
        [
            ("node_id", self.config.node_id.to_string()),
            ("node_type", PROTOCOL.to_string()),
        ]
    }

    /// GET an action and return the body of a successful response
    async fn get(&self, action: &str) -> std::result::Result<String, String> {
        let response = self
            .http
            .get(self.url(action))
            .query(&self.query())
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| describe_request_error(action, &e))?;

        read_success_body(action, response).await
    }
}

fn describe_request_error(action: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("{} request timed out", action)
    } else {
        format!("{} request failed: {}", action, err)
    }
}

async fn read_success_body(
    action: &str,
    response: reqwest::Response,
) -> std::result::Result<String, String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read {} response: {}", action, e))?;

    if !status.is_success() {
        return Err(format!(
            "{} returned {}: {}",
            action,
            status,
            truncate(&body, MAX_ERROR_BODY)
        ));
    }
    Ok(body)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[async_trait]
impl PanelClient for HttpPanelClient {
    async fn fetch_node_config(&self) -> Result<NodeConfig> {
        log::info!(node_id = self.config.node_id, "Fetching node configuration");

        let body = self
            .get("config")
            .await
            .map_err(NodeError::ConfigUnavailable)?;
        log::debug!(raw_data = %body, "Raw config data from panel");

        let config = NodeConfig::from_json(&body)?;
        log::info!(
            node_id = self.config.node_id,
            port = config.server_port,
            network = %config.transport,
            tls = config.tls,
            "Configuration fetched"
        );
        Ok(config)
    }

    async fn fetch_users(&self) -> Result<Vec<AuthorizedUser>> {
        let body = self.get("user").await.map_err(NodeError::TransientFetch)?;
        log::debug!(raw_data = %body, "Raw users data from panel");

        let users = parse_users(&body)?;
        log::debug!(node_id = self.config.node_id, count = users.len(), "Users fetched");
        Ok(users)
    }

    async fn report_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        if traffic.is_empty() {
            log::debug!("No traffic to submit");
            return Ok(());
        }

        let response = self
            .http
            .post(self.url("push"))
            .query(&self.query())
            .bearer_auth(&self.config.token)
            .json(traffic)
            .send()
            .await
            .map_err(|e| NodeError::Report(describe_request_error("push", &e)))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        read_success_body("push", response)
            .await
            .map_err(NodeError::Report)?;

        log::debug!(count = traffic.len(), "Traffic submitted successfully");
        Ok(())
    }
}

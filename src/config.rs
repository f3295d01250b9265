//! Configuration module for the VMess node
//!
//! Handles CLI argument parsing with environment variable support.
//! Node configuration itself is fetched from the panel, not from local files.

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NodeError, Result};
use crate::logger::LogMode;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    // Plain seconds, as the original flag was documented ("unit: second")
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

fn parse_log_mode(s: &str) -> std::result::Result<LogMode, String> {
    s.parse()
}

pub const DEFAULT_CERT_FILE: &str = "/root/.cert/server.crt";
pub const DEFAULT_KEY_FILE: &str = "/root/.cert/server.key";

/// Default per-request timeout of panel calls
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound on how long `close()` waits for the sync loop
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Slack added on top of the panel round trips a close may wait on
const CLOSE_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Bound for `close()` given the panel request timeout.
///
/// A close can land while a cycle's fetch or report is in flight, and the
/// loop then sends one final report: two panel round trips in the worst case.
pub fn close_timeout_for(api_timeout: Duration) -> Duration {
    api_timeout
        .saturating_mul(2)
        .saturating_add(CLOSE_TIMEOUT_MARGIN)
        .max(DEFAULT_CLOSE_TIMEOUT)
}

/// Unprefixed environment names still honoured by older deployments:
/// `(flag, prefixed var, bare alias)`
const ENV_ALIASES: &[(&str, &str, &str)] = &[
    ("--api", "X_PANDA_VMESS_API", "API"),
    ("--token", "X_PANDA_VMESS_TOKEN", "TOKEN"),
    ("--node", "X_PANDA_VMESS_NODE", "NODE"),
    ("--cert_file", "X_PANDA_VMESS_CERT_FILE", "CERT_FILE"),
    ("--key_file", "X_PANDA_VMESS_KEY_FILE", "KEY_FILE"),
    ("--sys_interval", "X_PANDA_VMESS_SYS_INTERVAL", "SYS_INTERVAL"),
    ("--log_mode", "X_PANDA_VMESS_LOG_LEVEL", "LOG_LEVEL"),
];

/// Turn bare alias variables into leading `--flag=value` arguments.
///
/// Precedence is command line, then `X_PANDA_VMESS_*`, then the bare alias:
/// an alias is only used when its prefixed variable is unset, and explicit
/// flags come later so they override it.
fn with_env_aliases<I, F>(args: I, lookup: F) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
    F: Fn(&str) -> Option<OsString>,
{
    let mut args = args.into_iter();
    let mut out: Vec<OsString> = args.next().into_iter().collect();
    for (flag, prefixed, alias) in ENV_ALIASES {
        if lookup(prefixed).is_some() {
            continue;
        }
        if let Some(value) = lookup(alias) {
            let mut arg = OsString::from(format!("{}=", flag));
            arg.push(value);
            out.push(arg);
        }
    }
    out.extend(args);
    out
}

/// CLI arguments for the VMess node
///
/// Supports environment variables with X_PANDA_VMESS_ prefix, and the bare
/// names in `ENV_ALIASES` as fallbacks
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vmess-node",
    author,
    version,
    about = "Provide vmess service for the v2Board(XFLASH-PANDA)"
)]
#[command(rename_all = "snake_case", args_override_self = true)]
pub struct CliArgs {
    /// Panel API base URL (e.g., "https://panel.example.com")
    #[arg(long, env = "X_PANDA_VMESS_API")]
    pub api: String,

    /// Token of the panel API
    #[arg(long, env = "X_PANDA_VMESS_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Node ID from the panel
    #[arg(long, env = "X_PANDA_VMESS_NODE")]
    pub node: u32,

    /// TLS certificate file path
    #[arg(long, env = "X_PANDA_VMESS_CERT_FILE", default_value = DEFAULT_CERT_FILE)]
    pub cert_file: PathBuf,

    /// TLS private key file path
    #[arg(long, env = "X_PANDA_VMESS_KEY_FILE", default_value = DEFAULT_KEY_FILE)]
    pub key_file: PathBuf,

    /// API request cycle (e.g., "60s", "2m" or plain seconds)
    #[arg(long, env = "X_PANDA_VMESS_SYS_INTERVAL", default_value = "60s", value_parser = parse_duration)]
    pub sys_interval: Duration,

    /// Panel API request timeout
    #[arg(long, env = "X_PANDA_VMESS_API_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub api_timeout: Duration,

    /// Log mode: debug, info, error
    #[arg(long, env = "X_PANDA_VMESS_LOG_LEVEL", default_value = "error", value_parser = parse_log_mode)]
    pub log_mode: LogMode,

    /// TLS handshake timeout for inbound connections
    #[arg(long, env = "X_PANDA_VMESS_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// TCP listen backlog for pending connections
    #[arg(long, env = "X_PANDA_VMESS_TCP_BACKLOG", default_value_t = 1024, help_heading = "Performance")]
    pub tcp_backlog: i32,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse_from(with_env_aliases(std::env::args_os(), |name| {
            std::env::var_os(name)
        }))
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if self.api.trim().is_empty() {
            return Err(NodeError::Config("panel API address is required".into()));
        }
        if !self.api.starts_with("http://") && !self.api.starts_with("https://") {
            return Err(NodeError::Config(format!(
                "panel API address must start with http:// or https://, got {}",
                self.api
            )));
        }
        if self.token.is_empty() {
            return Err(NodeError::Config("panel API token is required".into()));
        }
        if self.node == 0 {
            return Err(NodeError::Config(
                "Node ID must be a positive integer".into(),
            ));
        }
        if self.cert_file.as_os_str().is_empty() || self.key_file.as_os_str().is_empty() {
            return Err(NodeError::Config(
                "TLS certificate and key paths are required (--cert_file, --key_file)".into(),
            ));
        }
        if self.sys_interval.is_zero() {
            return Err(NodeError::Config(
                "sys_interval must be greater than 0".into(),
            ));
        }
        if self.api_timeout.is_zero() {
            return Err(NodeError::Config("api_timeout must be greater than 0".into()));
        }
        if self.tcp_backlog <= 0 {
            return Err(NodeError::Config("tcp_backlog must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Panel connection settings
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// Base URL without trailing slash
    pub api_host: String,
    /// Bearer token
    pub token: String,
    pub node_id: u32,
    /// Per-request timeout
    pub timeout: Duration,
}

impl PanelConfig {
    pub fn new(api_host: impl Into<String>, token: impl Into<String>, node_id: u32) -> Self {
        let api_host: String = api_host.into();
        Self {
            api_host: api_host.trim_end_matches('/').to_string(),
            token: token.into(),
            node_id,
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::new(&cli.api, &cli.token, cli.node).with_timeout(cli.api_timeout)
    }
}

/// Paths to the TLS certificate and key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from(DEFAULT_CERT_FILE),
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
        }
    }
}

/// Inbound listener tuning
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub tls_handshake_timeout: Duration,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tls_handshake_timeout: Duration::from_secs(10),
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

/// Operational parameters of the node service, immutable after construction
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Period of the fetch -> reconcile -> report cycle
    pub sync_interval: Duration,
    /// Upper bound on how long `close()` waits for the sync loop
    pub close_timeout: Duration,
    pub cert: CertConfig,
    pub listener: ListenerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            close_timeout: close_timeout_for(DEFAULT_API_TIMEOUT),
            cert: CertConfig::default(),
            listener: ListenerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            sync_interval: cli.sys_interval,
            close_timeout: close_timeout_for(cli.api_timeout),
            cert: CertConfig {
                cert_file: cli.cert_file.clone(),
                key_file: cli.key_file.clone(),
            },
            listener: ListenerConfig {
                tls_handshake_timeout: cli.tls_handshake_timeout,
                tcp_backlog: cli.tcp_backlog,
                tcp_nodelay: true,
            },
        }
    }
}

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log mode accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    Debug,
    Info,
    #[default]
    Error,
}

impl LogMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMode::Debug => "debug",
            LogMode::Info => "info",
            LogMode::Error => "error",
        }
    }
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogMode::Debug),
            "info" => Ok(LogMode::Info),
            "error" => Ok(LogMode::Error),
            other => Err(format!("log mode {} not supported", other)),
        }
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `mode`.
pub fn init_logger(mode: LogMode) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vmess_node={}", mode.as_str())));

    let debug = mode == LogMode::Debug;

    // A second init (e.g. from tests) is not an error worth reporting
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(debug)
                .with_line_number(debug)
                .with_ansi(true)
                .compact(),
        )
        .try_init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    /// Log an inbound connection event
    pub fn connection(peer: &str, event: &str) {
        debug!(peer = peer, event = event, "Connection");
    }
}

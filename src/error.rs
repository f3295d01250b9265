use std::io;
use thiserror::Error;

use crate::proxy::UserId;

/// Unified error type for the node agent
#[derive(Error, Debug)]
pub enum NodeError {
    /// Bad flags, environment or invalid local configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node configuration could not be obtained from the panel
    #[error("Node configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// User list could not be fetched this cycle
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// Traffic report was not accepted by the panel
    #[error("Traffic report failed: {0}")]
    Report(String),

    /// Inbound listener could not be bound
    #[error("Failed to bind inbound on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// User is already active in the proxy
    #[error("User {0} is already active")]
    DuplicateUser(UserId),

    /// User is not active in the proxy
    #[error("User {0} is not active")]
    UnknownUser(UserId),

    /// Another active user already authenticates with the same credential
    #[error("User {user_id} shares its credential with active user {holder}")]
    CredentialInUse { user_id: UserId, holder: UserId },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl NodeError {
    /// Whether this error must abort the process when hit during startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Config(_)
                | NodeError::ConfigUnavailable(_)
                | NodeError::Bind { .. }
                | NodeError::Tls(_)
                | NodeError::Io(_)
        )
    }

    /// Whether this error is an expected idempotency condition
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, NodeError::DuplicateUser(_) | NodeError::UnknownUser(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, NodeError>;

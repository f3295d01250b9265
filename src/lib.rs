//! VMess node agent
//!
//! Keeps a VMess inbound in sync with a v2board panel:
//! - `panel`: typed client for the panel's UniProxy API
//! - `proxy`: inbound listener, active user set and traffic counters
//! - `sync`: reconciliation and the periodic fetch/reconcile/report loop
//! - `service`: start/close lifecycle tying the pieces together

pub mod cert;
pub mod config;
pub mod error;
pub mod logger;
pub mod panel;
pub mod proxy;
pub mod service;
pub mod sync;

pub use error::{NodeError, Result};
pub use service::{NodeService, Service};

//! Panel to proxy synchronisation
//!
//! - `reconciler`: diff the panel's user list against what is applied
//! - `scheduler`: periodic fetch -> reconcile -> report loop

mod reconciler;
mod scheduler;

pub use reconciler::{ReconcileReport, Reconciler, UserSetSnapshot};
pub use scheduler::{format_bytes, CycleOutcome, SchedulerHandle, SchedulerState, SyncScheduler};

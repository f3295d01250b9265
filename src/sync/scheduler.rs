//! Periodic synchronisation loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::reconciler::{ReconcileReport, Reconciler};
use crate::error::Result;
use crate::logger::log;
use crate::panel::{PanelClient, UserTraffic};
use crate::proxy::{ProxyControl, TrafficRecord, UserId};

/// Render a byte count with a binary unit, e.g. `1.50KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Lifecycle of the sync loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl SchedulerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

/// Result of one call to [`SyncScheduler::run_cycle`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// All three steps ran; `reported` users were pushed to the panel
    Completed {
        reconcile: ReconcileReport,
        reported: usize,
    },
    /// Users were reconciled but the report failed and was buffered
    ReportFailed { reconcile: ReconcileReport },
    /// The user list could not be fetched; nothing else ran
    FetchFailed,
    /// Another cycle was in progress, or the loop is shutting down
    Skipped,
    /// Cancellation was observed between steps
    Cancelled,
}

/// Drives fetch -> reconcile -> report against a panel and a proxy.
///
/// At most one cycle runs at a time; a tick that finds a cycle in progress
/// is dropped.
pub struct SyncScheduler {
    node_id: u32,
    interval: Duration,
    panel: Arc<dyn PanelClient>,
    proxy: Arc<dyn ProxyControl>,
    reconciler: tokio::sync::Mutex<Reconciler>,
    /// Traffic whose report failed, sent again with the next report
    pending: Mutex<HashMap<UserId, TrafficRecord>>,
    state: AtomicU8,
}

impl SyncScheduler {
    pub fn new(
        node_id: u32,
        interval: Duration,
        panel: Arc<dyn PanelClient>,
        proxy: Arc<dyn ProxyControl>,
    ) -> Self {
        Self {
            node_id,
            interval,
            panel,
            proxy,
            reconciler: tokio::sync::Mutex::new(Reconciler::new(node_id)),
            pending: Mutex::new(HashMap::new()),
            state: AtomicU8::new(SchedulerState::Idle as u8),
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// User ids the reconciler believes are applied
    pub async fn applied_users(&self) -> Vec<UserId> {
        self.reconciler.lock().await.snapshot().keys().copied().collect()
    }

    /// Traffic waiting for a successful report
    pub fn pending_traffic(&self) -> HashMap<UserId, TrafficRecord> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch users and reconcile them, without reporting traffic.
    ///
    /// Used once at boot so users exist before the first tick.
    pub async fn sync_users(&self) -> Result<ReconcileReport> {
        let users = self.panel.fetch_users().await?;
        let mut reconciler = self.reconciler.lock().await;
        Ok(reconciler.reconcile(users, self.proxy.as_ref()).await)
    }

    /// Run one cycle unless another is already running
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        if !self.transition(SchedulerState::Idle, SchedulerState::Running) {
            log::debug!(node_id = self.node_id, state = ?self.state(), "Sync cycle skipped");
            return CycleOutcome::Skipped;
        }
        let outcome = self.cycle(cancel).await;
        // Shutdown may have moved the state on while we ran
        self.transition(SchedulerState::Running, SchedulerState::Idle);
        outcome
    }

    async fn cycle(&self, cancel: &CancellationToken) -> CycleOutcome {
        let users = match self.panel.fetch_users().await {
            Ok(users) => users,
            Err(e) => {
                log::warn!(node_id = self.node_id, operation = "fetch_users", error = %e, "Sync cycle skipped");
                return CycleOutcome::FetchFailed;
            }
        };
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let total = users.len();
        let reconcile = {
            let mut reconciler = self.reconciler.lock().await;
            reconciler.reconcile(users, self.proxy.as_ref()).await
        };
        log::debug!(node_id = self.node_id, total = total, "Users synchronized");
        if cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        match self.report_traffic().await {
            Ok(reported) => CycleOutcome::Completed {
                reconcile,
                reported,
            },
            Err(e) => {
                log::warn!(node_id = self.node_id, operation = "report_traffic", error = %e, "Failed to report traffic");
                CycleOutcome::ReportFailed { reconcile }
            }
        }
    }

    /// Snapshot the proxy's counters and push them with anything pending.
    ///
    /// On failure the whole batch goes back into the pending buffer.
    pub async fn report_traffic(&self) -> Result<usize> {
        let snapshot = self.proxy.snapshot_traffic().await;
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            merge_into(&mut pending, snapshot);
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut traffic: Vec<UserTraffic> = batch
            .iter()
            .map(|(id, record)| UserTraffic::from_record(*id, record))
            .collect();
        traffic.sort_by_key(|t| t.user_id);

        if let Err(e) = self.panel.report_traffic(&traffic).await {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            merge_into(&mut pending, batch);
            return Err(e);
        }

        let total_upload: u64 = traffic.iter().map(|t| t.u).sum();
        let total_download: u64 = traffic.iter().map(|t| t.d).sum();
        log::info!(
            node_id = self.node_id,
            users = traffic.len(),
            upload = %format_bytes(total_upload),
            download = %format_bytes(total_download),
            "Traffic reported"
        );
        Ok(traffic.len())
    }

    /// Spawn the loop; it runs until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> SchedulerHandle {
        let scheduler = Arc::clone(&self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { scheduler.run(token).await });
        log::info!(node_id = self.node_id, interval = ?self.interval, "Sync scheduler started");
        SchedulerHandle {
            cancel,
            task,
            scheduler: self,
        }
    }

    async fn run(&self, cancel: CancellationToken) {
        // First tick one period out; boot already synced users
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle(&cancel).await;
                }
            }
        }

        self.state
            .store(SchedulerState::ShuttingDown as u8, Ordering::Release);
        log::debug!(node_id = self.node_id, "Sync scheduler shutting down");
        if let Err(e) = self.report_traffic().await {
            log::warn!(node_id = self.node_id, operation = "report_traffic", error = %e, "Failed to report final traffic");
        }
        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        log::info!(node_id = self.node_id, "Sync scheduler stopped");
    }
}

fn merge_into(
    target: &mut HashMap<UserId, TrafficRecord>,
    records: HashMap<UserId, TrafficRecord>,
) {
    for (user_id, record) in records {
        target.entry(user_id).or_default().merge(&record);
    }
}

/// Handle for a spawned sync loop
pub struct SchedulerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    scheduler: Arc<SyncScheduler>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Cancel the loop and wait up to `timeout` for it to stop.
    ///
    /// Returns false if the loop did not stop in time; it is aborted then.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        log::info!("Stopping sync scheduler...");
        self.cancel.cancel();

        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!(error = %e, "Sync scheduler task panicked");
                true
            }
            Err(_) => {
                log::warn!(timeout = ?timeout, "Sync scheduler shutdown timeout");
                abort.abort();
                false
            }
        }
    }
}

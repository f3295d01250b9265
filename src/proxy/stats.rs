//! Per-user traffic accounting

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::hooks::{StatsCollector, UserId};

#[derive(Debug, Default)]
struct Counters {
    upload: AtomicU64,
    download: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    /// Move the totals out; only reachable with the shard write-locked
    fn drain(&mut self) -> TrafficRecord {
        TrafficRecord {
            upload: std::mem::take(self.upload.get_mut()),
            download: std::mem::take(self.download.get_mut()),
            requests: std::mem::take(self.requests.get_mut()),
        }
    }
}

/// Traffic accumulated for one user since the last flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficRecord {
    pub upload: u64,
    pub download: u64,
    pub requests: u64,
}

impl TrafficRecord {
    pub fn is_empty(&self) -> bool {
        self.upload == 0 && self.download == 0 && self.requests == 0
    }

    /// Add another record into this one
    pub fn merge(&mut self, other: &TrafficRecord) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
        self.requests = self.requests.saturating_add(other.requests);
    }
}

/// Lock-free traffic counters keyed by user.
///
/// Counters survive user removal until the next snapshot, so traffic a user
/// generated before being removed is still reported.
#[derive(Debug, Default)]
pub struct TrafficCollector {
    counters: DashMap<UserId, Counters>,
}

impl TrafficCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one user's counters without resetting them
    pub fn get(&self, user_id: UserId) -> Option<TrafficRecord> {
        self.counters.get(&user_id).map(|entry| load(entry.value()))
    }

    /// Drain every counter and return what was accumulated.
    ///
    /// Entries are drained and dropped shard by shard under the shard's write
    /// lock. A write racing with the snapshot either lands before its shard is
    /// visited or recreates the entry afterwards, so it shows up in exactly
    /// one snapshot.
    pub fn snapshot_and_reset(&self) -> HashMap<UserId, TrafficRecord> {
        let mut snapshot = HashMap::new();
        self.counters.retain(|user_id, counters| {
            let record = counters.drain();
            if !record.is_empty() {
                snapshot.insert(*user_id, record);
            }
            false
        });
        snapshot
    }

    /// Number of users with live counters
    pub fn user_count(&self) -> usize {
        self.counters.len()
    }
}

fn load(c: &Counters) -> TrafficRecord {
    TrafficRecord {
        upload: c.upload.load(Ordering::Relaxed),
        download: c.download.load(Ordering::Relaxed),
        requests: c.requests.load(Ordering::Relaxed),
    }
}

impl StatsCollector for TrafficCollector {
    fn record_request(&self, user_id: UserId) {
        self.counters
            .entry(user_id)
            .or_default()
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_upload(&self, user_id: UserId, bytes: u64) {
        self.counters
            .entry(user_id)
            .or_default()
            .upload
            .fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_download(&self, user_id: UserId, bytes: u64) {
        self.counters
            .entry(user_id)
            .or_default()
            .download
            .fetch_add(bytes, Ordering::Relaxed);
    }
}

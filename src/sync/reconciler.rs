//! User-set reconciliation
//!
//! Makes the proxy's active user set match the panel's latest list by
//! applying the minimal set of add/remove operations.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{NodeError, Result};
use crate::logger::log;
use crate::panel::AuthorizedUser;
use crate::proxy::{ProxyControl, UserId};

/// What is currently applied to the proxy, keyed and ordered by user id
pub type UserSetSnapshot = BTreeMap<UserId, AuthorizedUser>;

/// Outcome of one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Users that were not applied before and are now
    pub added: usize,
    /// Users that were applied and no longer are
    pub removed: usize,
    /// Users re-applied because their credential or quota changed
    pub updated: usize,
    /// Individual operations that failed
    pub failed: usize,
    /// Add/remove calls issued to the proxy
    pub operations: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.operations == 0
    }
}

/// Tracks the applied user set and drives the proxy towards a desired one
#[derive(Debug, Default)]
pub struct Reconciler {
    node_id: u32,
    snapshot: UserSetSnapshot,
}

impl Reconciler {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            snapshot: UserSetSnapshot::new(),
        }
    }

    /// Users believed to be active in the proxy
    pub fn snapshot(&self) -> &UserSetSnapshot {
        &self.snapshot
    }

    /// Apply `desired` to `proxy`.
    ///
    /// Removals run before additions, each list in ascending id order. A
    /// failing operation is logged and skipped; the snapshot afterwards holds
    /// exactly what the proxy accepted.
    pub async fn reconcile(
        &mut self,
        desired: Vec<AuthorizedUser>,
        proxy: &dyn ProxyControl,
    ) -> ReconcileReport {
        let desired = self.dedup(desired);
        let mut next = self.snapshot.clone();
        let mut report = ReconcileReport::default();

        let changed: BTreeSet<UserId> = desired
            .iter()
            .filter(|(id, user)| self.snapshot.get(*id).is_some_and(|cur| cur != *user))
            .map(|(id, _)| *id)
            .collect();

        let to_remove: Vec<UserId> = self
            .snapshot
            .keys()
            .copied()
            .filter(|id| !desired.contains_key(id) || changed.contains(id))
            .collect();

        for user_id in to_remove {
            report.operations += 1;
            match proxy.remove_user(user_id).await {
                Ok(()) => {
                    next.remove(&user_id);
                }
                Err(e) if e.is_idempotent_noop() => {
                    log::debug!(node_id = self.node_id, user_id = user_id, error = %e, "User already absent");
                    next.remove(&user_id);
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        node_id = self.node_id,
                        user_id = user_id,
                        operation = "remove",
                        error = %e,
                        "Failed to apply user change"
                    );
                }
            }
            if !next.contains_key(&user_id) && !changed.contains(&user_id) {
                report.removed += 1;
            }
        }

        // Changed users whose removal failed stay as they were
        let to_add: Vec<&AuthorizedUser> = desired
            .values()
            .filter(|user| !next.contains_key(&user.id))
            .collect();

        for user in to_add {
            report.operations += 1;
            let result = match proxy.add_user(user.clone()).await {
                Err(NodeError::DuplicateUser(_)) => {
                    // What the engine holds under this id is unknown; overwrite it
                    log::debug!(
                        node_id = self.node_id,
                        user_id = user.id,
                        "User already present, replacing"
                    );
                    report.operations += 2;
                    self.replace(user, proxy).await
                }
                other => other,
            };
            let applied = match result {
                Ok(()) => true,
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        node_id = self.node_id,
                        user_id = user.id,
                        operation = "add",
                        error = %e,
                        "Failed to apply user change"
                    );
                    false
                }
            };
            if applied {
                next.insert(user.id, user.clone());
                if changed.contains(&user.id) {
                    report.updated += 1;
                } else {
                    report.added += 1;
                }
            }
        }

        self.snapshot = next;

        if !report.is_noop() {
            log::info!(
                node_id = self.node_id,
                added = report.added,
                removed = report.removed,
                updated = report.updated,
                failed = report.failed,
                total = self.snapshot.len(),
                "Users reconciled"
            );
        }
        report
    }

    /// Remove whatever the proxy holds under `user.id`, then add `user`
    async fn replace(&self, user: &AuthorizedUser, proxy: &dyn ProxyControl) -> Result<()> {
        match proxy.remove_user(user.id).await {
            Ok(()) | Err(NodeError::UnknownUser(_)) => {}
            Err(e) => return Err(e),
        }
        proxy.add_user(user.clone()).await
    }

    /// Key the list by id; the first occurrence of an id wins
    fn dedup(&self, users: Vec<AuthorizedUser>) -> BTreeMap<UserId, AuthorizedUser> {
        let mut map = BTreeMap::new();
        for user in users {
            if map.contains_key(&user.id) {
                log::warn!(node_id = self.node_id, user_id = user.id, "Duplicate user id from panel, ignoring");
                continue;
            }
            map.insert(user.id, user);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertStore;
    use crate::panel::NodeConfig;
    use crate::proxy::TrafficRecord;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory proxy that records calls and can be told to fail
    #[derive(Default)]
    struct FakeProxy {
        active: Mutex<BTreeMap<UserId, AuthorizedUser>>,
        calls: Mutex<Vec<String>>,
        fail_add: HashSet<UserId>,
        fail_remove: HashSet<UserId>,
    }

    impl FakeProxy {
        fn failing_add(ids: &[UserId]) -> Self {
            Self {
                fail_add: ids.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn failing_remove(ids: &[UserId]) -> Self {
            Self {
                fail_remove: ids.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn active(&self) -> BTreeMap<UserId, AuthorizedUser> {
            self.active.lock().unwrap().clone()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProxyControl for FakeProxy {
        async fn start(&self, _node: &NodeConfig, _certs: &CertStore) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn add_user(&self, user: AuthorizedUser) -> Result<()> {
            self.calls.lock().unwrap().push(format!("add {}", user.id));
            if self.fail_add.contains(&user.id) {
                return Err(NodeError::CredentialInUse {
                    user_id: user.id,
                    holder: 0,
                });
            }
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&user.id) {
                return Err(NodeError::DuplicateUser(user.id));
            }
            active.insert(user.id, user);
            Ok(())
        }

        async fn remove_user(&self, user_id: UserId) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove {}", user_id));
            if self.fail_remove.contains(&user_id) {
                return Err(NodeError::Io(std::io::Error::other("engine busy")));
            }
            self.active
                .lock()
                .unwrap()
                .remove(&user_id)
                .map(|_| ())
                .ok_or(NodeError::UnknownUser(user_id))
        }

        async fn active_users(&self) -> Vec<UserId> {
            self.active.lock().unwrap().keys().copied().collect()
        }

        async fn snapshot_traffic(&self) -> HashMap<UserId, TrafficRecord> {
            HashMap::new()
        }
    }

    fn user(id: UserId) -> AuthorizedUser {
        AuthorizedUser::new(id, format!("uuid-{}", id))
    }

    fn users(ids: &[UserId]) -> Vec<AuthorizedUser> {
        ids.iter().map(|&id| user(id)).collect()
    }

    fn ids(map: &BTreeMap<UserId, AuthorizedUser>) -> Vec<UserId> {
        map.keys().copied().collect()
    }

    #[tokio::test]
    async fn test_initial_reconcile_adds_everyone() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);

        let report = reconciler.reconcile(users(&[3, 1, 2]), &proxy).await;
        assert_eq!(report.added, 3);
        assert_eq!(report.operations, 3);
        assert_eq!(ids(&proxy.active()), vec![1, 2, 3]);
        assert_eq!(ids(reconciler.snapshot()), vec![1, 2, 3]);
        assert_eq!(proxy.calls(), vec!["add 1", "add 2", "add 3"]);
    }

    #[tokio::test]
    async fn test_diff_counts_and_ordering() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1, 2, 3, 4]), &proxy).await;
        let before = proxy.calls().len();

        let report = reconciler.reconcile(users(&[3, 4, 5, 6, 7]), &proxy).await;

        // |B - A| + |A - B| = 3 + 2
        assert_eq!(report.operations, 5);
        assert_eq!(report.added, 3);
        assert_eq!(report.removed, 2);
        assert_eq!(ids(&proxy.active()), vec![3, 4, 5, 6, 7]);
        assert_eq!(
            proxy.calls()[before..],
            ["remove 1", "remove 2", "add 5", "add 6", "add 7"]
        );
    }

    #[tokio::test]
    async fn test_unchanged_set_is_noop() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1, 2]), &proxy).await;

        let report = reconciler.reconcile(users(&[2, 1]), &proxy).await;
        assert!(report.is_noop());
        assert_eq!(proxy.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_changed_credential_is_remove_then_add() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1, 2]), &proxy).await;

        let mut rotated = user(1);
        rotated.uuid = "uuid-1-new".to_string();
        let mut quota = user(2);
        quota.traffic_quota = Some(1024);

        let report = reconciler.reconcile(vec![rotated.clone(), quota], &proxy).await;
        assert_eq!(report.updated, 2);
        assert_eq!(report.added, 0);
        assert_eq!(report.removed, 0);
        assert_eq!(report.operations, 4);
        assert_eq!(proxy.active()[&1].uuid, "uuid-1-new");
        assert_eq!(proxy.active()[&2].traffic_quota, Some(1024));
        assert_eq!(reconciler.snapshot()[&1], rotated);
        assert_eq!(
            proxy.calls()[2..],
            ["remove 1", "remove 2", "add 1", "add 2"]
        );
    }

    #[tokio::test]
    async fn test_one_failed_add_does_not_abort_batch() {
        let proxy = FakeProxy::failing_add(&[3]);
        let mut reconciler = Reconciler::new(1);

        let report = reconciler.reconcile(users(&[1, 2, 3, 4, 5]), &proxy).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 4);
        assert_eq!(ids(&proxy.active()), vec![1, 2, 4, 5]);
        assert_eq!(ids(reconciler.snapshot()), vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_add_is_retried_next_time() {
        let proxy = FakeProxy::failing_add(&[2]);
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1, 2]), &proxy).await;

        // Same desired set: user 2 is still missing, so it is attempted again
        let report = reconciler.reconcile(users(&[1, 2]), &proxy).await;
        assert_eq!(report.operations, 1);
        assert_eq!(proxy.calls().last().unwrap(), "add 2");
    }

    #[tokio::test]
    async fn test_failed_remove_keeps_user_in_snapshot() {
        let proxy = FakeProxy::failing_remove(&[1]);
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1, 2]), &proxy).await;

        let report = reconciler.reconcile(users(&[2]), &proxy).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(ids(reconciler.snapshot()), vec![1, 2]);
        assert_eq!(ids(&proxy.active()), ids(reconciler.snapshot()));
    }

    #[tokio::test]
    async fn test_failed_remove_of_changed_user_skips_readd() {
        let proxy = FakeProxy::failing_remove(&[1]);
        let mut reconciler = Reconciler::new(1);
        reconciler.reconcile(users(&[1]), &proxy).await;

        let mut rotated = user(1);
        rotated.uuid = "rotated".to_string();
        let report = reconciler.reconcile(vec![rotated], &proxy).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(reconciler.snapshot()[&1].uuid, "uuid-1");
        assert_eq!(proxy.active()[&1].uuid, "uuid-1");
    }

    #[tokio::test]
    async fn test_failed_readd_drops_user_from_snapshot() {
        let proxy = FakeProxy::failing_add(&[1]);
        let mut reconciler = Reconciler::new(1);
        // Seed proxy and snapshot directly, bypassing the failing add
        proxy.active.lock().unwrap().insert(1, user(1));
        reconciler.snapshot.insert(1, user(1));

        let mut rotated = user(1);
        rotated.uuid = "rotated".to_string();
        let report = reconciler.reconcile(vec![rotated], &proxy).await;

        assert_eq!(report.failed, 1);
        assert!(reconciler.snapshot().is_empty());
        assert!(proxy.active().is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_errors_are_not_failures() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);

        // Drift: proxy already has 1, snapshot thinks 9 is active
        proxy.active.lock().unwrap().insert(1, user(1));
        reconciler.snapshot.insert(9, user(9));

        let report = reconciler.reconcile(users(&[1]), &proxy).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(ids(reconciler.snapshot()), vec![1]);
        assert_eq!(ids(&proxy.active()), vec![1]);
    }

    #[tokio::test]
    async fn test_stale_entry_in_proxy_is_overwritten() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);
        let mut stale = user(1);
        stale.uuid = "stale".to_string();
        proxy.active.lock().unwrap().insert(1, stale);

        let report = reconciler.reconcile(users(&[1]), &proxy).await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.added, 1);
        assert_eq!(proxy.active()[&1].uuid, "uuid-1");
        assert_eq!(reconciler.snapshot()[&1], proxy.active()[&1]);
        assert_eq!(proxy.calls(), vec!["add 1", "remove 1", "add 1"]);
    }

    #[tokio::test]
    async fn test_failed_overwrite_leaves_user_out_of_snapshot() {
        let proxy = FakeProxy::failing_remove(&[1]);
        let mut reconciler = Reconciler::new(1);
        proxy.active.lock().unwrap().insert(1, user(1));

        let report = reconciler.reconcile(users(&[1]), &proxy).await;
        assert_eq!(report.failed, 1);
        assert!(reconciler.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_ids_first_wins() {
        let proxy = FakeProxy::default();
        let mut reconciler = Reconciler::new(1);

        let mut second = user(1);
        second.uuid = "second".to_string();
        let report = reconciler.reconcile(vec![user(1), second], &proxy).await;

        assert_eq!(report.added, 1);
        assert_eq!(proxy.active()[&1].uuid, "uuid-1");
    }

    #[tokio::test]
    async fn test_active_set_equals_desired_for_many_pairs() {
        let sets: [&[UserId]; 5] = [&[], &[1, 2, 3], &[2, 3, 4, 5], &[9], &[1, 5, 9, 10]];
        for a in sets {
            for b in sets {
                let proxy = FakeProxy::default();
                let mut reconciler = Reconciler::new(1);
                reconciler.reconcile(users(a), &proxy).await;

                let report = reconciler.reconcile(users(b), &proxy).await;

                let a_set: BTreeSet<_> = a.iter().collect();
                let b_set: BTreeSet<_> = b.iter().collect();
                let expected_ops =
                    b_set.difference(&a_set).count() + a_set.difference(&b_set).count();
                assert_eq!(report.operations, expected_ops, "{:?} -> {:?}", a, b);
                assert_eq!(ids(&proxy.active()), b_set.into_iter().copied().collect::<Vec<_>>());
            }
        }
    }
}

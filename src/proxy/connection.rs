//! Connection tracking
//!
//! Tracks authenticated connections per user so that removing a user from the
//! active set also terminates the sessions it already has open.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::hooks::UserId;

/// Unique connection identifier
pub type ConnectionId = u64;

#[derive(Debug)]
struct ActiveConnection {
    user_id: UserId,
    #[allow(dead_code)]
    peer_addr: String,
    #[allow(dead_code)]
    connected_at: Instant,
    cancel_token: CancellationToken,
}

/// Registry of authenticated connections with kick-off capability
#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    next_conn_id: Arc<AtomicU64>,
    connections: Arc<DashMap<ConnectionId, ActiveConnection>>,
    /// user_id -> connection ids, for quick kick-off
    user_connections: Arc<DashMap<UserId, Vec<ConnectionId>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection for `user_id`.
    ///
    /// The returned guard's token is a child of `parent`, so it is cancelled
    /// by either a kick-off or the parent (inbound shutdown). Dropping the
    /// guard stops tracking the connection.
    pub fn register(
        &self,
        user_id: UserId,
        peer_addr: String,
        parent: &CancellationToken,
    ) -> ConnectionGuard {
        // Start at 1 so 0 never names a live connection
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel_token = parent.child_token();

        self.connections.insert(
            conn_id,
            ActiveConnection {
                user_id,
                peer_addr,
                connected_at: Instant::now(),
                cancel_token: cancel_token.clone(),
            },
        );
        self.user_connections
            .entry(user_id)
            .or_default()
            .push(conn_id);

        ConnectionGuard {
            manager: self.clone(),
            conn_id,
            user_id,
            cancel_token,
        }
    }

    fn unregister(&self, conn_id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&conn_id) {
            // remove_if_mut holds the shard lock across the check, so a
            // concurrent register() for the same user cannot be lost.
            self.user_connections
                .remove_if_mut(&conn.user_id, |_, conn_ids| {
                    conn_ids.retain(|&id| id != conn_id);
                    conn_ids.is_empty()
                });
        }
    }

    /// Cancel all connections of a user, returning how many were signalled
    pub fn kick_user(&self, user_id: UserId) -> usize {
        let mut kicked = 0;
        if let Some(conn_ids) = self.user_connections.get(&user_id) {
            for conn_id in conn_ids.iter() {
                if let Some(conn) = self.connections.get(conn_id) {
                    conn.cancel_token.cancel();
                    kicked += 1;
                }
            }
        }
        kicked
    }

    /// Cancel every tracked connection
    pub fn kick_all(&self) -> usize {
        let mut kicked = 0;
        for conn in self.connections.iter() {
            conn.cancel_token.cancel();
            kicked += 1;
        }
        kicked
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of users with at least one tracked connection
    pub fn user_count(&self) -> usize {
        self.user_connections.len()
    }
}

/// Tracks one authenticated connection until dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    manager: ConnectionManager,
    conn_id: ConnectionId,
    user_id: UserId,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Token cancelled when the user is kicked or the inbound stops
    pub fn token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.conn_id);
    }
}

//! Active user set of the inbound

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::hooks::{Authenticator, UserId};
use crate::error::{NodeError, Result};
use crate::panel::AuthorizedUser;

#[derive(Debug, Default)]
struct Indexes {
    by_id: HashMap<UserId, AuthorizedUser>,
    by_uuid: HashMap<String, UserId>,
}

/// Users currently allowed through the inbound.
///
/// Both indexes sit behind one lock, so a lookup from a connection task never
/// sees a user present in one index and missing from the other.
#[derive(Debug, Default)]
pub struct UserRegistry {
    inner: RwLock<Indexes>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Activate a user. Fails with `DuplicateUser` if the id is active and
    /// with `CredentialInUse` if another user owns the same uuid.
    pub fn add(&self, user: AuthorizedUser) -> Result<()> {
        let mut idx = self.write();
        if idx.by_id.contains_key(&user.id) {
            return Err(NodeError::DuplicateUser(user.id));
        }
        if let Some(&holder) = idx.by_uuid.get(&user.uuid) {
            return Err(NodeError::CredentialInUse {
                user_id: user.id,
                holder,
            });
        }
        idx.by_uuid.insert(user.uuid.clone(), user.id);
        idx.by_id.insert(user.id, user);
        Ok(())
    }

    /// Deactivate a user, returning its last applied entry
    pub fn remove(&self, user_id: UserId) -> Result<AuthorizedUser> {
        let mut idx = self.write();
        let user = idx
            .by_id
            .remove(&user_id)
            .ok_or(NodeError::UnknownUser(user_id))?;
        idx.by_uuid.remove(&user.uuid);
        Ok(user)
    }

    pub fn get(&self, user_id: UserId) -> Option<AuthorizedUser> {
        self.read().by_id.get(&user_id).cloned()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.read().by_id.contains_key(&user_id)
    }

    /// Active user ids in ascending order
    pub fn ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.read().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut idx = self.write();
        idx.by_id.clear();
        idx.by_uuid.clear();
    }
}

impl Authenticator for UserRegistry {
    fn authenticate(&self, uuid: &str) -> Option<UserId> {
        self.read().by_uuid.get(uuid).copied()
    }
}

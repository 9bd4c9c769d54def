//! Set of usernames currently believed to be online.

use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::event::Username;

/// Thread-safe online set shared by the delivery tasks of one or more
/// sessions.
///
/// Every call takes the lock once, so `add`/`remove` are atomic with respect
/// to each other and to `snapshot`. Entries are only removed on an explicit
/// Leave; a peer that vanishes without one stays listed.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: Mutex<BTreeSet<Username>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `user`, returning `true` if it was not already present.
    pub fn add(&self, user: Username) -> bool {
        self.lock().insert(user)
    }

    /// Removes `user`, returning `true` if it was present.
    pub fn remove(&self, user: &str) -> bool {
        self.lock().remove(user)
    }

    pub fn contains(&self, user: &str) -> bool {
        self.lock().contains(user)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the current set so callers can iterate without holding the lock.
    pub fn snapshot(&self) -> BTreeSet<Username> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    // A panic while holding the lock cannot leave a BTreeSet half-updated, so
    // a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, BTreeSet<Username>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Session Locks
//!
//! Per-`file_id` exclusive sections. Chunk writes hold a session shared and
//! their `(file_id, index)` slot exclusively; merge, abort and sweep hold the
//! session exclusively. Entries are dropped from the table once no task
//! holds or waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

struct LockTable<K, L> {
    entries: parking_lot::Mutex<HashMap<K, Arc<L>>>,
}

impl<K: Eq + Hash + Clone, L: Default> LockTable<K, L> {
    fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &K) -> Arc<L> {
        self.entries.lock().entry(key.clone()).or_default().clone()
    }

    /// Forget `key` if the table holds the last reference
    fn release(&self, key: &K) {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            entries.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct LocksInner {
    sessions: LockTable<String, RwLock<()>>,
    slots: LockTable<(String, u32), Mutex<()>>,
}

/// Keyed lock table shared by the upload service and the sweeper
#[derive(Clone)]
pub struct SessionLocks {
    inner: Arc<LocksInner>,
}

enum SessionHold {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Held section over one session
pub struct SessionGuard {
    hold: Option<SessionHold>,
    inner: Arc<LocksInner>,
    file_id: String,
}

impl SessionGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.hold, Some(SessionHold::Exclusive(_)))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hold.take();
        self.inner.sessions.release(&self.file_id);
    }
}

/// Held slot for one chunk index
pub struct SlotGuard {
    hold: Option<OwnedMutexGuard<()>>,
    inner: Arc<LocksInner>,
    key: (String, u32),
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.hold.take();
        self.inner.slots.release(&self.key);
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocksInner {
                sessions: LockTable::new(),
                slots: LockTable::new(),
            }),
        }
    }

    /// Enter a session alongside other chunk writers
    pub async fn shared(&self, file_id: &str) -> SessionGuard {
        let mut guard = self.session_guard(file_id);
        let lock = self.inner.sessions.entry(&guard.file_id);
        guard.hold = Some(SessionHold::Shared(lock.read_owned().await));
        guard
    }

    /// Enter a session alone
    pub async fn exclusive(&self, file_id: &str) -> SessionGuard {
        let mut guard = self.session_guard(file_id);
        let lock = self.inner.sessions.entry(&guard.file_id);
        guard.hold = Some(SessionHold::Exclusive(lock.write_owned().await));
        guard
    }

    /// Serialize writers of one chunk index
    pub async fn slot(&self, file_id: &str, index: u32) -> SlotGuard {
        // Guards exist before the wait so a cancelled wait still releases its entry
        let mut guard = SlotGuard {
            hold: None,
            inner: self.inner.clone(),
            key: (file_id.to_string(), index),
        };
        let lock = self.inner.slots.entry(&guard.key);
        guard.hold = Some(lock.lock_owned().await);
        guard
    }

    fn session_guard(&self, file_id: &str) -> SessionGuard {
        SessionGuard {
            hold: None,
            inner: self.inner.clone(),
            file_id: file_id.to_string(),
        }
    }

    /// Number of sessions and slots currently tracked
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.sessions.len() + self.inner.slots.len()
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

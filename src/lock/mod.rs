//! # Lock Manager
//!
//! Named-resource shared/exclusive locks owned by sessions.
//!
//! | Held by others | Shared request | Exclusive request |
//! |----------------|----------------|-------------------|
//! | nothing        | granted        | granted           |
//! | Shared         | granted        | waits             |
//! | Exclusive      | waits          | waits             |
//!
//! Locks are re-entrant per owner. A session holding Shared that asks for
//! Exclusive on the same key is upgraded in place as soon as no other
//! session holds the key. If a second session then also asks to upgrade the
//! same key, it fails fast with `LockConflict` instead of waiting on a
//! conversion deadlock.
//!
//! Waiting parks the calling thread on a `Condvar` until the lock becomes
//! compatible or the timeout elapses (`LockTimeout`). `ExclusiveWait` waits
//! without a deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::tx::TxId;
use crate::{Error, Result};

/// Requested lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    Shared,
    Exclusive,
    /// Exclusive, waiting for as long as it takes. Guards one-time
    /// initialization: the caller must re-check state once granted.
    ExclusiveWait,
}

impl LockType {
    fn is_exclusive(self) -> bool {
        !matches!(self, LockType::Shared)
    }
}

/// One granted acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

#[derive(Debug)]
struct Grant {
    owner: TxId,
    key: String,
    exclusive: bool,
}

#[derive(Debug, Default)]
struct Resource {
    shared: SmallVec<[(TxId, usize); 4]>,
    exclusive: Option<(TxId, usize)>,
    upgrading: Option<TxId>,
}

impl Resource {
    fn holds_shared(&self, owner: TxId) -> bool {
        self.shared.iter().any(|(h, _)| *h == owner)
    }

    fn can_grant(&self, owner: TxId, exclusive: bool) -> bool {
        if let Some((holder, _)) = self.exclusive {
            if holder != owner {
                return false;
            }
        }
        !exclusive || self.shared.iter().all(|(h, _)| *h == owner)
    }

    fn grant(&mut self, owner: TxId, exclusive: bool) {
        if exclusive {
            match &mut self.exclusive {
                Some((_, count)) => *count += 1,
                None => self.exclusive = Some((owner, 1)),
            }
        } else if let Some((_, count)) = self.shared.iter_mut().find(|(h, _)| *h == owner) {
            *count += 1;
        } else {
            self.shared.push((owner, 1));
        }
    }

    fn release(&mut self, owner: TxId, exclusive: bool) {
        if exclusive {
            if let Some((holder, count)) = &mut self.exclusive {
                if *holder == owner {
                    *count -= 1;
                    if *count == 0 {
                        self.exclusive = None;
                    }
                }
            }
        } else if let Some(pos) = self.shared.iter().position(|(h, _)| *h == owner) {
            self.shared[pos].1 -= 1;
            if self.shared[pos].1 == 0 {
                self.shared.remove(pos);
            }
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none() && self.upgrading.is_none()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<String, Resource>,
    grants: HashMap<LockId, Grant>,
}

impl LockTable {
    fn release(&mut self, id: LockId) -> bool {
        let Some(grant) = self.grants.remove(&id) else {
            return false;
        };
        if let Some(resource) = self.resources.get_mut(&grant.key) {
            resource.release(grant.owner, grant.exclusive);
            if resource.is_free() {
                self.resources.remove(&grant.key);
            }
        }
        true
    }
}

// ============================================================================
// LockManager
// ============================================================================

/// Shared lock table for all sessions of a store.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    next_id: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `owner` holds `lock_type` on `key`, or `timeout` elapses.
    pub fn acquire(
        &self,
        owner: TxId,
        key: &str,
        lock_type: LockType,
        timeout: Duration,
    ) -> Result<LockId> {
        let exclusive = lock_type.is_exclusive();
        let deadline = match lock_type {
            LockType::ExclusiveWait => None,
            _ => Some(Instant::now() + timeout),
        };

        let mut table = self.table.lock();
        let mut upgrading = false;
        loop {
            let resource = table.resources.entry(key.to_string()).or_default();
            if resource.can_grant(owner, exclusive) {
                if upgrading && resource.upgrading == Some(owner) {
                    resource.upgrading = None;
                }
                resource.grant(owner, exclusive);
                break;
            }

            if exclusive && !upgrading && resource.holds_shared(owner) {
                match resource.upgrading {
                    Some(other) if other != owner => {
                        warn!(%key, session = %owner, other = %other, "lock upgrade conflict");
                        return Err(Error::LockConflict { key: key.to_string() });
                    }
                    _ => {
                        resource.upgrading = Some(owner);
                        upgrading = true;
                    }
                }
            }

            trace!(%key, session = %owner, ?lock_type, "waiting for lock");
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut table, deadline).timed_out() {
                        if let Some(resource) = table.resources.get_mut(key) {
                            if resource.upgrading == Some(owner) {
                                resource.upgrading = None;
                            }
                            if resource.is_free() {
                                table.resources.remove(key);
                            }
                        }
                        self.released.notify_all();
                        warn!(%key, session = %owner, ?timeout, "lock timeout");
                        return Err(Error::LockTimeout { key: key.to_string(), timeout });
                    }
                }
                None => self.released.wait(&mut table),
            }
        }

        let id = LockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        table.grants.insert(id, Grant { owner, key: key.to_string(), exclusive });
        debug!(%key, session = %owner, exclusive, "lock granted");
        Ok(id)
    }

    /// Release one grant. Returns false if it was already released.
    pub fn release(&self, id: LockId) -> bool {
        let released = self.table.lock().release(id);
        if released {
            self.released.notify_all();
        }
        released
    }

    /// Release every grant of `owner`. Returns how many were released.
    pub fn release_owner(&self, owner: TxId) -> usize {
        let mut table = self.table.lock();
        let ids: Vec<LockId> = table
            .grants
            .iter()
            .filter(|(_, g)| g.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            table.release(*id);
        }
        drop(table);
        if !ids.is_empty() {
            self.released.notify_all();
        }
        ids.len()
    }

    /// Keys currently locked by `owner`, sorted.
    pub fn held_by(&self, owner: TxId) -> Vec<String> {
        let table = self.table.lock();
        let mut keys: Vec<String> = table
            .grants
            .values()
            .filter(|g| g.owner == owner)
            .map(|g| g.key.clone())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.table
            .lock()
            .resources
            .get(key)
            .is_some_and(|r| r.exclusive.is_some() || !r.shared.is_empty())
    }

    /// Number of outstanding grants.
    pub fn grant_count(&self) -> usize {
        self.table.lock().grants.len()
    }
}

// ============================================================================
// LockHandle
// ============================================================================

/// Scoped grant: dropping it releases this one lock only.
///
/// The owning session still releases everything it holds when it completes,
/// so a handle that outlives its session is harmless.
#[must_use = "dropping a LockHandle releases the lock immediately"]
#[derive(Debug)]
pub struct LockHandle {
    manager: Arc<LockManager>,
    id: LockId,
    key: String,
    lock_type: LockType,
}

impl LockHandle {
    pub(crate) fn new(manager: Arc<LockManager>, id: LockId, key: String, lock_type: LockType) -> Self {
        Self { manager, id, key, lock_type }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Explicit early release.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_shared_locks_coexist() {
        let locks = LockManager::new();
        locks.acquire(TxId(1), "k", LockType::Shared, SHORT).unwrap();
        locks.acquire(TxId(2), "k", LockType::Shared, SHORT).unwrap();
        assert_eq!(locks.grant_count(), 2);
    }

    #[test]
    fn test_exclusive_excludes_others() {
        let locks = LockManager::new();
        locks.acquire(TxId(1), "k", LockType::Exclusive, SHORT).unwrap();
        assert!(matches!(
            locks.acquire(TxId(2), "k", LockType::Shared, SHORT),
            Err(Error::LockTimeout { .. })
        ));
        assert!(matches!(
            locks.acquire(TxId(2), "k", LockType::Exclusive, SHORT),
            Err(Error::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_reentrant_for_same_owner() {
        let locks = LockManager::new();
        let a = locks.acquire(TxId(1), "k", LockType::Exclusive, SHORT).unwrap();
        let b = locks.acquire(TxId(1), "k", LockType::Exclusive, SHORT).unwrap();
        assert!(locks.release(a));
        assert!(locks.is_locked("k"));
        assert!(locks.release(b));
        assert!(!locks.is_locked("k"));
        assert!(!locks.release(b));
    }

    #[test]
    fn test_upgrade_without_contention() {
        let locks = LockManager::new();
        locks.acquire(TxId(1), "x", LockType::Shared, SHORT).unwrap();
        locks.acquire(TxId(1), "x", LockType::Exclusive, SHORT).unwrap();
        assert!(matches!(
            locks.acquire(TxId(2), "x", LockType::Shared, SHORT),
            Err(Error::LockTimeout { .. })
        ));
        assert_eq!(locks.release_owner(TxId(1)), 2);
        locks.acquire(TxId(2), "x", LockType::Shared, SHORT).unwrap();
    }

    #[test]
    fn test_upgrade_waits_for_other_shared_holder() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(TxId(1), "x", LockType::Shared, SHORT).unwrap();
        locks.acquire(TxId(2), "x", LockType::Shared, SHORT).unwrap();

        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(TxId(1), "x", LockType::Exclusive, LONG))
        };
        thread::sleep(Duration::from_millis(50));
        locks.release_owner(TxId(2));
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_second_upgrade_fails_fast() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(TxId(1), "x", LockType::Shared, SHORT).unwrap();
        locks.acquire(TxId(2), "x", LockType::Shared, SHORT).unwrap();

        let first = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(TxId(1), "x", LockType::Exclusive, LONG))
        };
        // Let the first upgrader register.
        thread::sleep(Duration::from_millis(50));
        let second = locks.acquire(TxId(2), "x", LockType::Exclusive, LONG);
        assert!(matches!(second, Err(Error::LockConflict { .. })));

        locks.release_owner(TxId(2));
        assert!(first.join().unwrap().is_ok());
    }

    #[test]
    fn test_timeout_clears_upgrade_marker() {
        let locks = LockManager::new();
        locks.acquire(TxId(1), "x", LockType::Shared, SHORT).unwrap();
        locks.acquire(TxId(2), "x", LockType::Shared, SHORT).unwrap();
        assert!(matches!(
            locks.acquire(TxId(1), "x", LockType::Exclusive, SHORT),
            Err(Error::LockTimeout { .. })
        ));
        // Nobody is upgrading any more, so this waits (and times out) instead of conflicting.
        assert!(matches!(
            locks.acquire(TxId(2), "x", LockType::Exclusive, SHORT),
            Err(Error::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_exclusive_wait_blocks_until_release() {
        let locks = Arc::new(LockManager::new());
        let held = locks.acquire(TxId(1), "schema", LockType::Exclusive, SHORT).unwrap();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.acquire(TxId(2), "schema", LockType::ExclusiveWait, SHORT))
        };
        // Longer than the nominal timeout: ExclusiveWait ignores it.
        thread::sleep(Duration::from_millis(150));
        locks.release(held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_handle_releases_only_its_lock() {
        let locks = Arc::new(LockManager::new());
        let x = locks.acquire(TxId(1), "x", LockType::Exclusive, SHORT).unwrap();
        let y = locks.acquire(TxId(1), "y", LockType::Exclusive, SHORT).unwrap();
        let hx = LockHandle::new(locks.clone(), x, "x".into(), LockType::Exclusive);
        let _hy = LockHandle::new(locks.clone(), y, "y".into(), LockType::Exclusive);
        drop(hx);
        assert!(!locks.is_locked("x"));
        assert!(locks.is_locked("y"));
        assert_eq!(locks.held_by(TxId(1)), vec!["y".to_string()]);
    }
}

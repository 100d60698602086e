//! A reentrant exclusive lock keyed on an application-supplied owner.
//!
//! Where an ordinary reentrant lock treats the calling thread as the
//! holding principal, an [`OwnedLock`] lets the application choose: any
//! value can act as the owner, handles created for equal owners are
//! interchangeable, and reentrancy follows the owner rather than the
//! thread. Two threads sharing an owner share its hold; one thread using
//! two owners contends against itself.
//!
//! Owners are interned on first sight, and the interned id travels inside
//! the synchronizer request, so the predicates always know on whose behalf
//! they run.

use crate::queue::{Condition, ExclusivePolicy, QueueSynchronizer, SyncPolicy};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use static_assertions as sa;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Request of the [`OwnerPolicy`]: which owner is asking, and for how many
/// acquisitions.
#[derive(Clone, Copy, Debug)]
pub struct OwnedRequest {
    owner: u64,
    count: u32,
}

/// Synchronizer policy of [`OwnedLock`]. The state word is the reentrancy
/// depth; the holding owner's id lives next to it and is meaningful only
/// while the depth is nonzero.
#[derive(Debug, Default)]
pub struct OwnerPolicy {
    holder: AtomicU64,
}

impl SyncPolicy for OwnerPolicy {
    type Req = OwnedRequest;
}

impl ExclusivePolicy for OwnerPolicy {
    fn try_acquire(&self, state: &AtomicU32, req: OwnedRequest) -> bool {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 {
                match state.compare_exchange(0, req.count, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => {
                        self.holder.store(req.owner, Ordering::Relaxed);
                        return true;
                    }
                    Err(observed) => {
                        s = observed;
                        continue;
                    }
                }
            }

            if self.holder.load(Ordering::Relaxed) != req.owner {
                return false;
            }

            // Reentrant on the holding owner, possibly from another thread.
            let depth = s
                .checked_add(req.count)
                .unwrap_or_else(|| panic!("lock depth overflow"));
            match state.compare_exchange(s, depth, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(observed) => s = observed,
            }
        }
    }

    fn try_release(&self, state: &AtomicU32, req: OwnedRequest) -> bool {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 || self.holder.load(Ordering::Relaxed) != req.owner {
                panic!("unlock by an owner that does not hold the lock");
            }
            if req.count > s {
                panic!("unlock exceeds the held depth");
            }

            let depth = s - req.count;
            if depth == 0 {
                // The holder id must be gone before the state opens up.
                self.holder.store(0, Ordering::Relaxed);
                match state.compare_exchange(s, 0, Ordering::Release, Ordering::Relaxed) {
                    Ok(_) => return true,
                    Err(observed) => {
                        self.holder.store(req.owner, Ordering::Relaxed);
                        s = observed;
                    }
                }
            } else {
                match state.compare_exchange(s, depth, Ordering::Release, Ordering::Relaxed) {
                    Ok(_) => return false,
                    Err(observed) => s = observed,
                }
            }
        }
    }

    fn release_all(&self, state: &AtomicU32, probe: OwnedRequest) -> Option<OwnedRequest> {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 || self.holder.load(Ordering::Relaxed) != probe.owner {
                return None;
            }
            self.holder.store(0, Ordering::Relaxed);
            match state.compare_exchange(s, 0, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => {
                    return Some(OwnedRequest {
                        owner: probe.owner,
                        count: s,
                    })
                }
                Err(observed) => {
                    self.holder.store(probe.owner, Ordering::Relaxed);
                    s = observed;
                }
            }
        }
    }

    fn is_held(&self, state: &AtomicU32, probe: OwnedRequest) -> bool {
        state.load(Ordering::Relaxed) != 0
            && self.holder.load(Ordering::Relaxed) == probe.owner
    }
}

/// A reentrant exclusive lock whose holder is an owner value, not a thread.
pub struct OwnedLock<O> {
    sync: QueueSynchronizer<OwnerPolicy>,
    owners: Mutex<FxHashMap<O, u64>>,
}

sa::assert_impl_all!(OwnedLock<String>: Send, Sync);

impl<O: Eq + Hash> OwnedLock<O> {
    /// Constructs an unlocked `OwnedLock`.
    pub fn new() -> Self {
        Self {
            sync: QueueSynchronizer::new(OwnerPolicy::default()),
            owners: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns a lock handle bound to `owner`.
    ///
    /// Handles created for equal owners are functionally equivalent: any of
    /// them acquires and releases the same hold.
    pub fn lock_for(&self, owner: O) -> OwnerLock<'_> {
        let mut owners = self.owners.lock();
        let fresh = owners.len() as u64 + 1;
        let owner = *owners.entry(owner).or_insert(fresh);
        OwnerLock {
            sync: &self.sync,
            owner,
        }
    }

    /// Returns whether any owner currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.sync.state_relaxed() != 0
    }
}

impl<O: Eq + Hash> Default for OwnedLock<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Debug> Debug for OwnedLock<O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLock")
            .field("depth", &self.sync.state_relaxed())
            .finish_non_exhaustive()
    }
}

/// Lock handle of an [`OwnedLock`], bound to one owner.
#[derive(Clone, Copy)]
pub struct OwnerLock<'a> {
    sync: &'a QueueSynchronizer<OwnerPolicy>,
    owner: u64,
}

impl<'a> OwnerLock<'a> {
    fn request(&self, count: u32) -> OwnedRequest {
        OwnedRequest {
            owner: self.owner,
            count,
        }
    }

    /// Acquires the lock for this handle's owner, blocking while another
    /// owner holds it. Reentrant for the owner, even across threads.
    ///
    /// # Panics
    ///
    /// Panics if the reentrancy depth would overflow.
    pub fn lock(&self) {
        self.sync.acquire(self.request(1));
    }

    /// Acquires the lock if it is free or already held by this owner.
    pub fn try_lock(&self) -> bool {
        self.sync.try_acquire(self.request(1))
    }

    /// Acquires the lock, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    /// Acquires the lock, giving up at `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.sync.try_acquire_until(self.request(1), deadline)
    }

    /// Releases one acquisition of this handle's owner, unlocking once the
    /// depth reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if this owner does not hold the lock.
    pub fn unlock(&self) {
        self.sync.release(self.request(1));
    }

    /// Creates a condition bound to this handle's owner.
    pub fn new_condition(&self) -> Condition<'a, OwnerPolicy> {
        self.sync.condition(self.request(0))
    }
}

impl Debug for OwnerLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_owners_share_a_hold() {
        let lock = OwnedLock::new();
        let first = lock.lock_for("a");
        let second = lock.lock_for("a");

        first.lock();
        assert!(second.try_lock());
        assert_eq!(lock.sync.state_relaxed(), 2);
        second.unlock();
        first.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn distinct_owners_contend_even_on_one_thread() {
        let lock = OwnedLock::new();
        let one = lock.lock_for(1);
        let two = lock.lock_for(2);

        one.lock();
        one.lock();
        assert!(!two.try_lock());
        one.unlock();
        assert!(!two.try_lock());
        one.unlock();
        assert!(two.try_lock());
        two.unlock();
    }

    #[test]
    #[should_panic(expected = "does not hold the lock")]
    fn unlock_without_hold_panics() {
        let lock = OwnedLock::new();
        lock.lock_for("a").unlock();
    }

    #[test]
    #[should_panic(expected = "does not hold the lock")]
    fn unlock_by_the_wrong_owner_panics() {
        let lock = OwnedLock::new();
        lock.lock_for("a").lock();
        lock.lock_for("b").unlock();
    }

    #[test]
    #[should_panic(expected = "lock depth overflow")]
    fn depth_saturates() {
        let lock = OwnedLock::new();
        let handle = lock.lock_for("a");
        handle.lock();
        lock.sync.force_state(u32::MAX);
        handle.lock();
    }
}

//! Room set whose rooms are discovered lazily.
//!
//! The first lock request for a key mints a fresh room index and widens the
//! index mask once the room count crosses a power of two. Because indices
//! are stored bit-reversed, widening is a pure extension: a handle minted
//! at a narrow mask stays valid at every wider one. What can go stale is an
//! occupancy count acquired against a narrower mask, which is what the
//! [`MaskStrategy`] chosen at construction guards against.

use crate::queue::{QueueSynchronizer, SharedPolicy, SyncPolicy};
use crate::rooms::{index_mask, occupy_once_more, vacate_once};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use static_assertions as sa;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// How a [`DynamicRoomSet`] reads the index mask while the room table may
/// be growing underneath it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaskStrategy {
    /// Read the mask once per attempt and re-read it after a successful
    /// transition; if it widened in between, back out and retry. Two mask
    /// reads per acquisition in the common case. The default.
    #[default]
    Revalidate,
    /// Reload the mask on every iteration of the acquire and release
    /// loops. No post-success check, potentially many mask reads.
    Reload,
    /// Read the mask once and make a single compare-and-swap attempt.
    /// Suited to `try_lock`-style use where the caller manages retries; a
    /// blocking `lock` still retries between wakeups.
    OneShot,
}

/// Synchronizer policy of [`DynamicRoomSet`]: the index mask is derived
/// from a live registration counter.
#[derive(Debug)]
pub struct DynamicRoomPolicy {
    registered: AtomicU32,
    strategy: MaskStrategy,
}

impl DynamicRoomPolicy {
    fn mask(&self) -> u32 {
        match self.registered.load(Ordering::Acquire) {
            0 => 0,
            highest => index_mask(highest),
        }
    }

    fn acquire_revalidate(&self, state: &AtomicU32, room: u32) -> i32 {
        let mut mask = self.mask();
        loop {
            let mut s = state.load(Ordering::Relaxed);
            let joined = loop {
                let (next, joined) = if s == 0 {
                    (room | 1, false)
                } else if s & mask == room {
                    (occupy_once_more(s, room, mask), true)
                } else {
                    return -1;
                };
                match state.compare_exchange_weak(s, next, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => break joined,
                    Err(observed) => s = observed,
                }
            };

            let current = self.mask();
            if !joined || current == mask {
                // A first occupant's encoding is width-independent, so only
                // a joined count can have raced a widening.
                return 1;
            }
            // Back out with the mask the join was checked against and
            // recompute on the widened one.
            release_with_mask(state, room, mask);
            mask = current;
        }
    }

    fn acquire_reload(&self, state: &AtomicU32, room: u32) -> i32 {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            let mask = self.mask();
            let next = if s == 0 {
                room | 1
            } else if s & mask == room {
                occupy_once_more(s, room, mask)
            } else {
                return -1;
            };
            match state.compare_exchange_weak(s, next, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return 1,
                Err(observed) => s = observed,
            }
        }
    }

    fn acquire_one_shot(&self, state: &AtomicU32, room: u32) -> i32 {
        let mask = self.mask();
        let s = state.load(Ordering::Relaxed);
        let next = if s == 0 {
            room | 1
        } else if s & mask == room {
            occupy_once_more(s, room, mask)
        } else {
            return -1;
        };
        match state.compare_exchange(s, next, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => 1,
            Err(_) => -1,
        }
    }
}

fn release_with_mask(state: &AtomicU32, room: u32, mask: u32) -> bool {
    let mut s = state.load(Ordering::Relaxed);
    loop {
        if s == 0 || s & mask != room {
            panic!("room unlock does not match the occupied room");
        }
        let next = vacate_once(s, mask);
        match state.compare_exchange_weak(s, next, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return next == 0,
            Err(observed) => s = observed,
        }
    }
}

impl SyncPolicy for DynamicRoomPolicy {
    /// The bit-reversed index of the room being acquired or released.
    type Req = u32;
}

impl SharedPolicy for DynamicRoomPolicy {
    fn try_acquire_shared(&self, state: &AtomicU32, room: u32) -> i32 {
        match self.strategy {
            MaskStrategy::Revalidate => self.acquire_revalidate(state, room),
            MaskStrategy::Reload => self.acquire_reload(state, room),
            MaskStrategy::OneShot => self.acquire_one_shot(state, room),
        }
    }

    fn try_release_shared(&self, state: &AtomicU32, room: u32) -> bool {
        if self.strategy == MaskStrategy::Reload {
            let mut s = state.load(Ordering::Relaxed);
            loop {
                let mask = self.mask();
                if s == 0 || s & mask != room {
                    panic!("room unlock does not match the occupied room");
                }
                let next = vacate_once(s, mask);
                match state.compare_exchange_weak(s, next, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => return next == 0,
                    Err(observed) => s = observed,
                }
            }
        } else {
            release_with_mask(state, room, self.mask())
        }
    }
}

/// A room set that mints rooms on first request.
///
/// Behaves like a [`RoomSet`](crate::RoomSet) whose key set is discovered
/// as it is used: the first `lock_for` of a key registers a new room.
pub struct DynamicRoomSet<K> {
    sync: QueueSynchronizer<DynamicRoomPolicy>,
    rooms: Mutex<FxHashMap<K, u32>>,
}

sa::assert_impl_all!(DynamicRoomSet<String>: Send, Sync);

impl<K: Eq + Hash> DynamicRoomSet<K> {
    /// Constructs an empty room set with the default
    /// [`MaskStrategy::Revalidate`].
    pub fn new() -> Self {
        Self::with_strategy(MaskStrategy::default())
    }

    /// Constructs an empty room set with the given mask strategy.
    pub fn with_strategy(strategy: MaskStrategy) -> Self {
        Self {
            sync: QueueSynchronizer::new(DynamicRoomPolicy {
                registered: AtomicU32::new(0),
                strategy,
            }),
            rooms: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the lock handle of the room for `key`, registering a fresh
    /// room on first sight of the key.
    pub fn lock_for(&self, key: K) -> DynamicRoomLock<'_> {
        let mut rooms = self.rooms.lock();
        let room = *rooms.entry(key).or_insert_with(|| {
            let index = self
                .sync
                .policy()
                .registered
                .fetch_add(1, Ordering::AcqRel)
                + 1;
            index.reverse_bits()
        });
        DynamicRoomLock {
            sync: &self.sync,
            room,
        }
    }

    /// Returns how many rooms have been registered so far.
    pub fn rooms_registered(&self) -> u32 {
        self.sync.policy().registered.load(Ordering::Acquire)
    }

    /// Returns whether any room is currently occupied.
    pub fn is_occupied(&self) -> bool {
        self.sync.state_relaxed() != 0
    }
}

impl<K: Eq + Hash> Default for DynamicRoomSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Debug> Debug for DynamicRoomSet<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRoomSet")
            .field("registered", &self.sync.policy().registered)
            .field("strategy", &self.sync.policy().strategy)
            .field("state", &self.sync.state_relaxed())
            .finish()
    }
}

/// Lock handle of one room in a [`DynamicRoomSet`].
#[derive(Clone, Copy)]
pub struct DynamicRoomLock<'a> {
    sync: &'a QueueSynchronizer<DynamicRoomPolicy>,
    room: u32,
}

impl DynamicRoomLock<'_> {
    /// Enters the room, blocking while another room is occupied.
    ///
    /// # Panics
    ///
    /// Panics if the room's occupancy count would overflow.
    pub fn lock(&self) {
        self.sync.acquire_shared(self.room);
    }

    /// Enters the room if no other room is occupied.
    pub fn try_lock(&self) -> bool {
        self.sync.try_acquire_shared(self.room)
    }

    /// Enters the room, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    /// Enters the room, giving up at `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.sync.try_acquire_shared_until(self.room, deadline)
    }

    /// Leaves the room, releasing the set once the last party has left.
    ///
    /// # Panics
    ///
    /// Panics if this room is not the occupied one.
    pub fn unlock(&self) {
        self.sync.release_shared(self.room);
    }
}

impl Debug for DynamicRoomLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRoomLock")
            .field("room", &self.room.reverse_bits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_minted_in_first_sight_order() {
        let set = DynamicRoomSet::new();
        let a = set.lock_for("a");
        let b = set.lock_for("b");
        let a_again = set.lock_for("a");
        assert_eq!(set.rooms_registered(), 2);
        assert_eq!(a.room, 1u32.reverse_bits());
        assert_eq!(b.room, 2u32.reverse_bits());
        assert_eq!(a_again.room, a.room);
    }

    #[test]
    fn handles_survive_mask_widening() {
        let set = DynamicRoomSet::new();
        let a = set.lock_for("a");
        a.lock();

        // Registering a second room widens the mask from one bit to two;
        // the held encoding remains valid at the new width.
        let b = set.lock_for("b");
        assert!(!b.try_lock());
        a.unlock();
        assert!(b.try_lock());
        b.unlock();
    }

    #[test]
    fn strategies_agree_on_the_basics() {
        for strategy in [
            MaskStrategy::Revalidate,
            MaskStrategy::Reload,
            MaskStrategy::OneShot,
        ] {
            let set = DynamicRoomSet::with_strategy(strategy);
            let a = set.lock_for("a");
            let b = set.lock_for("b");

            a.lock();
            a.lock();
            assert!(!b.try_lock());
            a.unlock();
            assert!(!b.try_lock());
            a.unlock();
            assert!(b.try_lock());
            b.unlock();
            assert!(!set.is_occupied());
        }
    }

    #[test]
    #[should_panic(expected = "does not match the occupied room")]
    fn unlock_of_an_empty_set_panics() {
        let set = DynamicRoomSet::new();
        let a = set.lock_for("a");
        a.unlock();
    }
}

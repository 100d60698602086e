//! A fixed set of rooms sharing one synchronizer.
//!
//! Each room offers a reentrant shared lock: any number of parties may hold
//! one room together, but no two rooms are ever occupied at the same time.
//! The state word packs the occupying room's index, bit-reversed so that it
//! sits flush against the high end of the word, together with a flush-right
//! count of outstanding unlocks. The split between the two is the index
//! mask, the minimum block of leading bits that can represent the highest
//! room index.

use crate::queue::{QueueSynchronizer, SharedPolicy, SyncPolicy};
use rustc_hash::FxHashMap;
use static_assertions as sa;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Returns the mask selecting the index bits for room indices `1..=max`.
pub(crate) fn index_mask(max_index: u32) -> u32 {
    debug_assert!(max_index >= 1);
    let width = 32 - max_index.leading_zeros();
    !0 << (32 - width)
}

/// One more party enters the occupied room: increments the count and
/// panics if the carry would spill into the index bits.
pub(crate) fn occupy_once_more(state: u32, room: u32, mask: u32) -> u32 {
    let next = state.wrapping_add(1);
    if next & mask != room {
        panic!("room occupancy count overflow");
    }
    next
}

/// One party leaves: decrements the count, clearing the index bits along
/// with the last count.
pub(crate) fn vacate_once(state: u32, mask: u32) -> u32 {
    let next = state - 1;
    if next & !mask == 0 {
        0
    } else {
        next
    }
}

/// Synchronizer policy of [`RoomSet`]: the index mask is fixed at
/// construction.
#[derive(Debug)]
pub struct RoomPolicy {
    mask: u32,
}

impl SyncPolicy for RoomPolicy {
    /// The bit-reversed index of the room being acquired or released.
    type Req = u32;
}

impl SharedPolicy for RoomPolicy {
    fn try_acquire_shared(&self, state: &AtomicU32, room: u32) -> i32 {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            let next = if s == 0 {
                room | 1
            } else if s & self.mask == room {
                occupy_once_more(s, room, self.mask)
            } else {
                return -1;
            };
            match state.compare_exchange_weak(s, next, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return 1,
                Err(observed) => s = observed,
            }
        }
    }

    fn try_release_shared(&self, state: &AtomicU32, room: u32) -> bool {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 || s & self.mask != room {
                panic!("room unlock does not match the occupied room");
            }
            let next = vacate_once(s, self.mask);
            match state.compare_exchange_weak(s, next, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return next == 0,
                Err(observed) => s = observed,
            }
        }
    }
}

/// A fixed set of rooms with mutual exclusion across rooms.
///
/// Rooms are numbered in the iteration order of the keys handed to
/// [`new`](Self::new); the set cannot grow afterwards. See
/// [`DynamicRoomSet`](crate::DynamicRoomSet) for a lazily growing variant.
pub struct RoomSet<K> {
    pub(crate) sync: QueueSynchronizer<RoomPolicy>,
    pub(crate) rooms: FxHashMap<K, u32>,
}

sa::assert_impl_all!(RoomSet<String>: Send, Sync);

impl<K: Eq + Hash> RoomSet<K> {
    /// Constructs a room set with one room per key, indexed in iteration
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if a key occurs twice.
    pub fn new<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        let mut rooms = FxHashMap::default();
        let mut index: u32 = 0;
        for key in keys {
            index += 1;
            if rooms.insert(key, index.reverse_bits()).is_some() {
                panic!("duplicate room key");
            }
        }
        let mask = if index == 0 { 0 } else { index_mask(index) };
        Self {
            sync: QueueSynchronizer::new(RoomPolicy { mask }),
            rooms,
        }
    }

    /// Returns the lock handle of the room registered for `key`.
    ///
    /// # Panics
    ///
    /// Panics if no room was registered for `key`.
    pub fn lock_for(&self, key: &K) -> RoomLock<'_> {
        let room = *self
            .rooms
            .get(key)
            .unwrap_or_else(|| panic!("unknown room key"));
        RoomLock {
            sync: &self.sync,
            room,
        }
    }

    /// Returns whether any room is currently occupied.
    pub fn is_occupied(&self) -> bool {
        self.sync.state_relaxed() != 0
    }
}

impl<K: Debug> Debug for RoomSet<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSet")
            .field("rooms", &self.rooms.len())
            .field("state", &self.sync.state_relaxed())
            .finish()
    }
}

/// Lock handle of one room in a [`RoomSet`].
#[derive(Clone, Copy)]
pub struct RoomLock<'a> {
    sync: &'a QueueSynchronizer<RoomPolicy>,
    room: u32,
}

impl RoomLock<'_> {
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

impl Debug for RoomLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomLock")
            .field("room", &self.room.reverse_bits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_covers_the_highest_index() {
        assert_eq!(index_mask(1), 1 << 31);
        assert_eq!(index_mask(2), 0b11 << 30);
        assert_eq!(index_mask(3), 0b11 << 30);
        assert_eq!(index_mask(4), 0b111 << 29);
    }

    #[test]
    fn state_packs_reversed_index_and_count() {
        let set = RoomSet::new(["m", "f"]);
        let m = set.lock_for(&"m");
        m.lock();
        assert_eq!(set.sync.state_relaxed(), 1u32.reverse_bits() | 1);
        m.lock();
        assert_eq!(set.sync.state_relaxed(), 1u32.reverse_bits() | 2);
        m.unlock();
        m.unlock();
        assert_eq!(set.sync.state_relaxed(), 0);
    }

    #[test]
    fn occupied_room_excludes_the_other() {
        let set = RoomSet::new(["m", "f"]);
        set.lock_for(&"m").lock();
        assert!(!set.lock_for(&"f").try_lock());
        assert!(set.lock_for(&"m").try_lock());
        set.lock_for(&"m").unlock();
        assert!(!set.lock_for(&"f").try_lock());
        set.lock_for(&"m").unlock();
        assert!(set.lock_for(&"f").try_lock());
        set.lock_for(&"f").unlock();
    }

    #[test]
    #[should_panic(expected = "room occupancy count overflow")]
    fn occupancy_count_saturates() {
        let set = RoomSet::new(["only"]);
        set.lock_for(&"only").lock();
        // Fill the count field right up to the index bit.
        set.sync.force_state(1u32.reverse_bits() | !index_mask(1));
        set.lock_for(&"only").lock();
    }

    #[test]
    #[should_panic(expected = "does not match the occupied room")]
    fn unlock_of_an_empty_set_panics() {
        let set = RoomSet::new(["m", "f"]);
        set.lock_for(&"m").unlock();
    }

    #[test]
    #[should_panic(expected = "does not match the occupied room")]
    fn unlock_of_the_wrong_room_panics() {
        let set = RoomSet::new(["m", "f"]);
        set.lock_for(&"m").lock();
        set.lock_for(&"f").unlock();
    }

    #[test]
    #[should_panic(expected = "duplicate room key")]
    fn duplicate_keys_are_rejected() {
        let _ = RoomSet::new(["m", "m"]);
    }

    #[test]
    #[should_panic(expected = "unknown room key")]
    fn unknown_key_panics() {
        let set = RoomSet::new(["m"]);
        let _ = set.lock_for(&"f");
    }
}

//! Room set with per-room exit handlers.
//!
//! A [`NotifyingRoomSet`] behaves exactly like a
//! [`RoomSet`](crate::RoomSet), except that each room may carry a handler
//! that runs when the room empties: on the thread performing the final
//! release, after the compare-and-swap that clears the state and after
//! queued contenders have been signaled. A panicking handler therefore
//! propagates to the `unlock` caller without stranding waiters.

use crate::queue::QueueSynchronizer;
use crate::rooms::{RoomPolicy, RoomSet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use static_assertions as sa;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

type ExitHandler = Arc<dyn Fn() + Send + Sync>;

/// A [`RoomSet`](crate::RoomSet) that can notify when a room empties.
pub struct NotifyingRoomSet<K> {
    rooms: RoomSet<K>,
    handlers: Mutex<FxHashMap<u32, ExitHandler>>,
}

sa::assert_impl_all!(NotifyingRoomSet<String>: Send, Sync);

impl<K: Eq + Hash> NotifyingRoomSet<K> {
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
        Self {
            rooms: RoomSet::new(keys),
            handlers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the lock handle of the room registered for `key`.
    ///
    /// # Panics
    ///
    /// Panics if no room was registered for `key`.
    pub fn lock_for(&self, key: &K) -> NotifyingRoomLock<'_> {
        let room = *self
            .rooms
            .rooms
            .get(key)
            .unwrap_or_else(|| panic!("unknown room key"));
        NotifyingRoomLock {
            sync: &self.rooms.sync,
            handlers: &self.handlers,
            room,
        }
    }

    /// Registers `handler` to run whenever the room for `key` empties.
    /// Replaces a previously registered handler.
    ///
    /// # Panics
    ///
    /// Panics if no room was registered for `key`.
    pub fn set_exit_handler<F>(&self, key: &K, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let room = *self
            .rooms
            .rooms
            .get(key)
            .unwrap_or_else(|| panic!("unknown room key"));
        self.handlers.lock().insert(room, Arc::new(handler));
    }

    /// Removes the exit handler of the room for `key`, if any.
    ///
    /// # Panics
    ///
    /// Panics if no room was registered for `key`.
    pub fn clear_exit_handler(&self, key: &K) {
        let room = *self
            .rooms
            .rooms
            .get(key)
            .unwrap_or_else(|| panic!("unknown room key"));
        self.handlers.lock().remove(&room);
    }

    /// Returns whether any room is currently occupied.
    pub fn is_occupied(&self) -> bool {
        self.rooms.is_occupied()
    }
}

impl<K: Debug> Debug for NotifyingRoomSet<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyingRoomSet")
            .field("rooms", &self.rooms)
            .field("handlers", &self.handlers.lock().len())
            .finish()
    }
}

/// Lock handle of one room in a [`NotifyingRoomSet`].
#[derive(Clone)]
pub struct NotifyingRoomLock<'a> {
    sync: &'a QueueSynchronizer<RoomPolicy>,
    handlers: &'a Mutex<FxHashMap<u32, ExitHandler>>,
    room: u32,
}

impl NotifyingRoomLock<'_> {
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

    /// Leaves the room. If this was the last party, queued contenders are
    /// woken and the room's exit handler, if any, runs on this thread.
    ///
    /// # Panics
    ///
    /// Panics if this room is not the occupied one. Panics from the exit
    /// handler propagate to the caller.
    pub fn unlock(&self) {
        if self.sync.release_shared(self.room) {
            let handler = self.handlers.lock().get(&self.room).cloned();
            if let Some(handler) = handler {
                handler();
            }
        }
    }
}

impl Debug for NotifyingRoomLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyingRoomLock")
            .field("room", &self.room.reverse_bits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handler_runs_once_per_emptying() {
        let set = NotifyingRoomSet::new(["m", "f"]);
        let emptied = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&emptied);
        set.set_exit_handler(&"f", move || {
            witness.fetch_add(1, Ordering::Relaxed);
        });

        let f = set.lock_for(&"f");
        f.lock();
        f.lock();
        f.unlock();
        assert_eq!(emptied.load(Ordering::Relaxed), 0);
        f.unlock();
        assert_eq!(emptied.load(Ordering::Relaxed), 1);

        // The next occupancy cycle triggers the handler again.
        f.lock();
        f.unlock();
        assert_eq!(emptied.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn rooms_without_handlers_stay_silent() {
        let set = NotifyingRoomSet::new(["m", "f"]);
        let emptied = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&emptied);
        set.set_exit_handler(&"f", move || {
            witness.fetch_add(1, Ordering::Relaxed);
        });

        let m = set.lock_for(&"m");
        m.lock();
        m.unlock();
        assert_eq!(emptied.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn reregistering_replaces_the_handler() {
        let set = NotifyingRoomSet::new(["f"]);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let witness = Arc::clone(&first);
        set.set_exit_handler(&"f", move || {
            witness.fetch_add(1, Ordering::Relaxed);
        });
        let witness = Arc::clone(&second);
        set.set_exit_handler(&"f", move || {
            witness.fetch_add(1, Ordering::Relaxed);
        });

        let f = set.lock_for(&"f");
        f.lock();
        f.unlock();
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cleared_handlers_do_not_run() {
        let set = NotifyingRoomSet::new(["f"]);
        let emptied = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&emptied);
        set.set_exit_handler(&"f", move || {
            witness.fetch_add(1, Ordering::Relaxed);
        });
        set.clear_exit_handler(&"f");

        let f = set.lock_for(&"f");
        f.lock();
        f.unlock();
        assert_eq!(emptied.load(Ordering::Relaxed), 0);
    }
}

//! A lock with four modes: read, intent-read, write and intent-write.
//!
//! Intent modes announce upcoming activity without taking the full mode.
//! Which modes may coexist is fixed by a compatibility matrix (`Y` = may
//! coexist):
//!
//! ```text
//!        IR  R   IW  W
//!   IR   Y   Y   Y   X
//!   R    Y   Y   X   X
//!   IW   Y   X   Y   X
//!   W    X   X   X   X
//! ```
//!
//! Only the write mode is reentrant and only the write handle hands out
//! conditions. The other modes do not detect recursive use: a recursive
//! acquisition simply takes another slot in the holder count and must be
//! matched by another release.

use crate::queue::{Condition, ExclusivePolicy, QueueSynchronizer, SharedPolicy, SyncPolicy};
use static_assertions as sa;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// The top two bits of the state word select the mode; the low 30 bits hold
// counts. The two shared modes split their 30 bits into an upper 15-bit
// intent-reader count and a lower 15-bit count of the other participant
// class. The exclusive mode uses all 30 bits as the write depth.
const TAG_SHIFT: u32 = 30;
const TAG_MASK: u32 = 0b11 << TAG_SHIFT;
const INTENT: u32 = 0b01 << TAG_SHIFT;
const READ: u32 = 0b10 << TAG_SHIFT;
const EXCLUSIVE: u32 = 0b11 << TAG_SHIFT;

const UPPER_SHIFT: u32 = 15;
const FIELD_MAX: u32 = (1 << UPPER_SHIFT) - 1;
const DEPTH_MASK: u32 = !TAG_MASK;
const DEPTH_MAX: u32 = DEPTH_MASK;

const READ_REQ: u32 = READ | 1;
const INTENT_WRITE_REQ: u32 = INTENT | 1;
const INTENT_READ_REQ: u32 = READ | (1 << UPPER_SHIFT);
const ALT_INTENT_READ_REQ: u32 = INTENT | (1 << UPPER_SHIFT);
const WRITE_REQ: u32 = EXCLUSIVE | 1;

sa::const_assert_eq!(TAG_MASK, 0xC000_0000);
sa::const_assert_eq!(DEPTH_MAX, 0x3FFF_FFFF);
sa::const_assert_eq!(FIELD_MAX, 0x7FFF);

fn upper_of(word: u32) -> u32 {
    (word >> UPPER_SHIFT) & FIELD_MAX
}

fn lower_of(word: u32) -> u32 {
    word & FIELD_MAX
}

/// An intent-read request installs the READ tag, but an intent-reader may
/// just as well join a lock held in the INTENT mode; rewrite the request to
/// the equivalent form of the mode in place.
fn normalize(req: u32, tag: u32) -> u32 {
    if req == INTENT_READ_REQ && tag == INTENT {
        ALT_INTENT_READ_REQ
    } else {
        req
    }
}

/// Returns a stable nonzero token for the calling thread.
fn thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|token| token as *const u8 as usize)
}

/// Synchronizer policy of [`ModeLock`].
#[derive(Debug, Default)]
pub struct ModePolicy {
    /// Token of the thread holding the write mode. Meaningful only while
    /// the state tag is EXCLUSIVE.
    writer: AtomicUsize,
}

impl SyncPolicy for ModePolicy {
    type Req = u32;
}

impl SharedPolicy for ModePolicy {
    fn try_acquire_shared(&self, state: &AtomicU32, req: u32) -> i32 {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 {
                match state.compare_exchange_weak(0, req, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => return 1,
                    Err(observed) => {
                        s = observed;
                        continue;
                    }
                }
            }

            let tag = s & TAG_MASK;
            if tag == EXCLUSIVE {
                return -1;
            }
            let req = normalize(req, tag);
            if req & TAG_MASK != tag {
                // Readers and intent-writers exclude each other; switching
                // between the two shared modes requires draining to free.
                return -1;
            }

            let upper = upper_of(s) + upper_of(req);
            let lower = lower_of(s) + lower_of(req);
            if upper > FIELD_MAX {
                panic!("intent-reader count overflow");
            }
            if lower > FIELD_MAX {
                panic!("shared holder count overflow");
            }

            let next = tag | (upper << UPPER_SHIFT) | lower;
            match state.compare_exchange_weak(s, next, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return 1,
                Err(observed) => s = observed,
            }
        }
    }

    fn try_release_shared(&self, state: &AtomicU32, req: u32) -> bool {
        let mut s = state.load(Ordering::Relaxed);
        loop {
            let tag = s & TAG_MASK;
            if s == 0 || tag == EXCLUSIVE {
                panic!("shared unlock of a multi-mode lock that is not shared-locked");
            }
            let req = normalize(req, tag);
            if req & TAG_MASK != tag {
                panic!("shared unlock does not match the held mode");
            }

            let (held_upper, held_lower) = (upper_of(s), lower_of(s));
            let (sub_upper, sub_lower) = (upper_of(req), lower_of(req));
            if sub_upper > held_upper || sub_lower > held_lower {
                panic!("shared unlock exceeds the held count");
            }

            let (upper, lower) = (held_upper - sub_upper, held_lower - sub_lower);
            let next = if upper == 0 && lower == 0 {
                0
            } else {
                tag | (upper << UPPER_SHIFT) | lower
            };
            match state.compare_exchange_weak(s, next, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return next == 0,
                Err(observed) => s = observed,
            }
        }
    }
}

impl ExclusivePolicy for ModePolicy {
    fn try_acquire(&self, state: &AtomicU32, req: u32) -> bool {
        let me = thread_token();
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s == 0 {
                match state.compare_exchange_weak(0, req, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => {
                        self.writer.store(me, Ordering::Relaxed);
                        return true;
                    }
                    Err(observed) => {
                        s = observed;
                        continue;
                    }
                }
            }

            if s & TAG_MASK != EXCLUSIVE || self.writer.load(Ordering::Relaxed) != me {
                return false;
            }

            // Reentrant on the holding thread.
            let depth = (s & DEPTH_MASK) + (req & DEPTH_MASK);
            if depth > DEPTH_MAX {
                panic!("write depth overflow");
            }
            match state.compare_exchange_weak(
                s,
                EXCLUSIVE | depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => s = observed,
            }
        }
    }

    fn try_release(&self, state: &AtomicU32, req: u32) -> bool {
        let me = thread_token();
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s & TAG_MASK != EXCLUSIVE || self.writer.load(Ordering::Relaxed) != me {
                panic!("write unlock by a thread that does not hold the write lock");
            }

            let held = s & DEPTH_MASK;
            let sub = req & DEPTH_MASK;
            if sub > held {
                panic!("write unlock exceeds the held depth");
            }

            let depth = held - sub;
            if depth == 0 {
                // The writer token must be gone before the state opens up.
                self.writer.store(0, Ordering::Relaxed);
                match state.compare_exchange(s, 0, Ordering::Release, Ordering::Relaxed) {
                    Ok(_) => return true,
                    Err(observed) => {
                        self.writer.store(me, Ordering::Relaxed);
                        s = observed;
                    }
                }
            } else {
                match state.compare_exchange(
                    s,
                    EXCLUSIVE | depth,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return false,
                    Err(observed) => s = observed,
                }
            }
        }
    }

    fn release_all(&self, state: &AtomicU32, _probe: u32) -> Option<u32> {
        let me = thread_token();
        let mut s = state.load(Ordering::Relaxed);
        loop {
            if s & TAG_MASK != EXCLUSIVE || self.writer.load(Ordering::Relaxed) != me {
                return None;
            }
            self.writer.store(0, Ordering::Relaxed);
            match state.compare_exchange(s, 0, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return Some(s),
                Err(observed) => {
                    self.writer.store(me, Ordering::Relaxed);
                    s = observed;
                }
            }
        }
    }

    fn is_held(&self, state: &AtomicU32, _probe: u32) -> bool {
        state.load(Ordering::Relaxed) & TAG_MASK == EXCLUSIVE
            && self.writer.load(Ordering::Relaxed) == thread_token()
    }
}

/// A lock with read, intent-read, write and intent-write modes.
///
/// The four mode handles share a single state word; which of them may hold
/// it together is fixed by the compatibility matrix in the [module
/// documentation](self).
pub struct ModeLock {
    sync: QueueSynchronizer<ModePolicy>,
}

sa::assert_impl_all!(ModeLock: Send, Sync);

impl ModeLock {
    /// Constructs an unlocked `ModeLock`.
    pub fn new() -> Self {
        Self {
            sync: QueueSynchronizer::new(ModePolicy::default()),
        }
    }

    /// Returns the read-mode handle.
    pub fn read_lock(&self) -> SharedModeLock<'_> {
        SharedModeLock {
            sync: &self.sync,
            req: READ_REQ,
        }
    }

    /// Returns the intent-read handle.
    ///
    /// Intent-readers coexist with readers and with intent-writers, joining
    /// whichever shared mode currently occupies the lock.
    pub fn intent_read_lock(&self) -> SharedModeLock<'_> {
        SharedModeLock {
            sync: &self.sync,
            req: INTENT_READ_REQ,
        }
    }

    /// Returns the intent-write handle.
    pub fn intent_write_lock(&self) -> SharedModeLock<'_> {
        SharedModeLock {
            sync: &self.sync,
            req: INTENT_WRITE_REQ,
        }
    }

    /// Alias for [`intent_write_lock`](Self::intent_write_lock), for
    /// callers that use the intent-write mode to guard counter increments.
    pub fn increment_lock(&self) -> SharedModeLock<'_> {
        self.intent_write_lock()
    }

    /// Returns the write-mode handle. The write mode is exclusive and
    /// reentrant, and is the only mode that supports conditions.
    pub fn write_lock(&self) -> WriteModeLock<'_> {
        WriteModeLock { sync: &self.sync }
    }

    /// Returns whether any mode currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.sync.state_relaxed() != 0
    }
}

impl Default for ModeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ModeLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = self.sync.state_relaxed();
        let mut out = f.debug_struct("ModeLock");
        match s & TAG_MASK {
            _ if s == 0 => out.field("mode", &"free"),
            INTENT => out
                .field("mode", &"intent")
                .field("intent_readers", &upper_of(s))
                .field("intent_writers", &lower_of(s)),
            READ => out
                .field("mode", &"read")
                .field("intent_readers", &upper_of(s))
                .field("readers", &lower_of(s)),
            _ => out.field("mode", &"write").field("depth", &(s & DEPTH_MASK)),
        };
        out.finish()
    }
}

/// Handle for one of the shared modes of a [`ModeLock`].
#[derive(Clone, Copy)]
pub struct SharedModeLock<'a> {
    sync: &'a QueueSynchronizer<ModePolicy>,
    req: u32,
}

impl SharedModeLock<'_> {
    /// Acquires this mode, blocking while an incompatible mode holds the
    /// lock.
    ///
    /// # Panics
    ///
    /// Panics if the holder count of this mode would overflow.
    pub fn lock(&self) {
        self.sync.acquire_shared(self.req);
    }

    /// Acquires this mode if it is immediately compatible with the current
    /// holders.
    pub fn try_lock(&self) -> bool {
        self.sync.try_acquire_shared(self.req)
    }

    /// Acquires this mode, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    /// Acquires this mode, giving up at `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.sync.try_acquire_shared_until(self.req, deadline)
    }

    /// Releases one acquisition of this mode.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held in this mode.
    pub fn unlock(&self) {
        self.sync.release_shared(self.req);
    }
}

impl Debug for SharedModeLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mode = match self.req {
            READ_REQ => "read",
            INTENT_READ_REQ => "intent-read",
            _ => "intent-write",
        };
        f.debug_struct("SharedModeLock").field("mode", &mode).finish()
    }
}

/// Handle for the exclusive write mode of a [`ModeLock`].
#[derive(Clone, Copy)]
pub struct WriteModeLock<'a> {
    sync: &'a QueueSynchronizer<ModePolicy>,
}

impl<'a> WriteModeLock<'a> {
    /// Acquires the write mode, blocking while any other party holds the
    /// lock. Reentrant on the holding thread.
    ///
    /// # Panics
    ///
    /// Panics if the write depth would overflow.
    pub fn lock(&self) {
        self.sync.acquire(WRITE_REQ);
    }

    /// Acquires the write mode if the lock is free or already held by the
    /// calling thread.
    pub fn try_lock(&self) -> bool {
        self.sync.try_acquire(WRITE_REQ)
    }

    /// Acquires the write mode, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_lock_until(deadline),
            None => {
                self.lock();
                true
            }
        }
    }

    /// Acquires the write mode, giving up at `deadline`.
    pub fn try_lock_until(&self, deadline: Instant) -> bool {
        self.sync.try_acquire_until(WRITE_REQ, deadline)
    }

    /// Releases one write acquisition, unlocking once the depth reaches
    /// zero.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the write mode.
    pub fn unlock(&self) {
        self.sync.release(WRITE_REQ);
    }

    /// Creates a condition bound to the write mode.
    pub fn new_condition(&self) -> Condition<'a, ModePolicy> {
        self.sync.condition(WRITE_REQ)
    }
}

impl Debug for WriteModeLock<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteModeLock").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_state_is_zero() {
        let lock = ModeLock::new();
        assert_eq!(lock.sync.state_relaxed(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn read_then_intent_read_share_the_read_tag() {
        let lock = ModeLock::new();
        lock.read_lock().lock();
        lock.intent_read_lock().lock();
        assert_eq!(lock.sync.state_relaxed(), READ | (1 << UPPER_SHIFT) | 1);

        lock.read_lock().unlock();
        assert_eq!(lock.sync.state_relaxed(), READ | (1 << UPPER_SHIFT));
        lock.intent_read_lock().unlock();
        assert_eq!(lock.sync.state_relaxed(), 0);
    }

    #[test]
    fn intent_read_joins_the_intent_mode() {
        let lock = ModeLock::new();
        lock.intent_write_lock().lock();
        assert!(lock.intent_read_lock().try_lock());
        assert_eq!(lock.sync.state_relaxed(), INTENT | (1 << UPPER_SHIFT) | 1);

        // The intent-reader releases with its canonical request; the state
        // must drain through the INTENT form all the same.
        lock.intent_read_lock().unlock();
        lock.intent_write_lock().unlock();
        assert_eq!(lock.sync.state_relaxed(), 0);
    }

    #[test]
    fn lone_alt_intent_read_release_frees_the_lock() {
        let lock = ModeLock::new();
        lock.intent_write_lock().lock();
        lock.intent_read_lock().lock();
        lock.intent_write_lock().unlock();
        assert_eq!(lock.sync.state_relaxed(), ALT_INTENT_READ_REQ);

        lock.intent_read_lock().unlock();
        assert_eq!(lock.sync.state_relaxed(), 0);
    }

    #[test]
    fn readers_exclude_intent_writers() {
        let lock = ModeLock::new();
        lock.read_lock().lock();
        assert!(!lock.intent_write_lock().try_lock());
        lock.read_lock().unlock();
        assert!(lock.intent_write_lock().try_lock());
        assert!(!lock.read_lock().try_lock());
        lock.intent_write_lock().unlock();
    }

    #[test]
    fn intent_read_first_installs_the_read_tag() {
        let lock = ModeLock::new();
        lock.intent_read_lock().lock();
        assert_eq!(lock.sync.state_relaxed(), INTENT_READ_REQ);
        // The READ tag is in place, so intent-writers wait.
        assert!(!lock.intent_write_lock().try_lock());
        lock.intent_read_lock().unlock();
    }

    #[test]
    fn write_reentrancy_counts_in_the_state_word() {
        let lock = ModeLock::new();
        let write = lock.write_lock();
        write.lock();
        write.lock();
        assert_eq!(lock.sync.state_relaxed(), EXCLUSIVE | 2);
        write.unlock();
        assert_eq!(lock.sync.state_relaxed(), EXCLUSIVE | 1);
        write.unlock();
        assert_eq!(lock.sync.state_relaxed(), 0);
    }

    #[test]
    fn write_excludes_everything() {
        let lock = ModeLock::new();
        lock.write_lock().lock();
        assert!(!lock.read_lock().try_lock());
        assert!(!lock.intent_read_lock().try_lock());
        assert!(!lock.intent_write_lock().try_lock());
        lock.write_lock().unlock();
    }

    #[test]
    #[should_panic(expected = "shared holder count overflow")]
    fn reader_count_saturates() {
        let lock = ModeLock::new();
        lock.sync.force_state(READ | FIELD_MAX);
        lock.read_lock().lock();
    }

    #[test]
    #[should_panic(expected = "intent-reader count overflow")]
    fn intent_reader_count_saturates() {
        let lock = ModeLock::new();
        lock.sync.force_state(READ | (FIELD_MAX << UPPER_SHIFT) | 1);
        lock.intent_read_lock().lock();
    }

    #[test]
    #[should_panic(expected = "write depth overflow")]
    fn write_depth_saturates() {
        let lock = ModeLock::new();
        let write = lock.write_lock();
        write.lock();
        lock.sync.force_state(EXCLUSIVE | DEPTH_MAX);
        write.lock();
    }

    #[test]
    #[should_panic(expected = "not shared-locked")]
    fn unlock_of_a_free_lock_panics() {
        let lock = ModeLock::new();
        lock.read_lock().unlock();
    }

    #[test]
    #[should_panic(expected = "does not match the held mode")]
    fn mismatched_shared_unlock_panics() {
        let lock = ModeLock::new();
        lock.read_lock().lock();
        lock.intent_write_lock().unlock();
    }

    #[test]
    #[should_panic(expected = "does not hold the write lock")]
    fn write_unlock_without_hold_panics() {
        let lock = ModeLock::new();
        lock.write_lock().unlock();
    }
}

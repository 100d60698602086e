//! The queue-based synchronizer underlying every lock in this crate.
//!
//! A [`QueueSynchronizer`] owns a single 32-bit state word and a FIFO queue
//! of parked threads. What an acquisition *means* is supplied by the
//! embedding primitive through a policy: a set of compare-and-swap
//! predicates over the state word. The synchronizer itself is only
//! concerned with queueing contenders, putting them to sleep and waking
//! them again.
//!
//! The synchronizer is not fair. A thread that arrives while a wakeup is in
//! flight may barge in and acquire the state ahead of the queued waiters,
//! which is why woken threads always re-run their predicate.

use parking_lot_core::{ParkResult, RequeueOp, SpinWait, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Base trait of all synchronizer policies.
///
/// The request type carries everything a predicate needs to know about the
/// party asking: a mode and a count for the multi-mode lock, a room index
/// for the room locks, an owner id and a count for the owned lock.
pub trait SyncPolicy {
    /// Opaque request argument threaded through to the predicates.
    type Req: Copy;
}

/// Predicates for the shared acquisition path.
///
/// Implementations perform all state transitions with compare-and-swap
/// loops on an observed previous value and never store blindly.
pub trait SharedPolicy: SyncPolicy {
    /// Attempts a non-blocking shared acquisition.
    ///
    /// Returns a negative value if the caller must wait. A non-negative
    /// value means the acquisition succeeded; a positive value additionally
    /// signals that queued waiters may now succeed as well and should be
    /// given a chance to run.
    fn try_acquire_shared(&self, state: &AtomicU32, req: Self::Req) -> i32;

    /// Releases a shared acquisition.
    ///
    /// Returns `true` iff the state word returned to the fully released
    /// value, at which point the synchronizer wakes queued contenders.
    ///
    /// # Panics
    ///
    /// Panics if the release does not correspond to a prior successful
    /// acquisition.
    fn try_release_shared(&self, state: &AtomicU32, req: Self::Req) -> bool;
}

/// Predicates for the exclusive acquisition path.
///
/// Only exclusive policies support [`Condition`]s.
pub trait ExclusivePolicy: SyncPolicy {
    /// Attempts a non-blocking exclusive acquisition.
    ///
    /// Returns `false` if the caller must wait.
    fn try_acquire(&self, state: &AtomicU32, req: Self::Req) -> bool;

    /// Releases an exclusive acquisition.
    ///
    /// Returns `true` iff the state word returned to the fully released
    /// value.
    ///
    /// # Panics
    ///
    /// Panics if the release does not correspond to a prior successful
    /// acquisition by the same principal.
    fn try_release(&self, state: &AtomicU32, req: Self::Req) -> bool;

    /// Releases the entire reentrant depth in one step.
    ///
    /// On success returns the request that restores the released depth when
    /// passed back to [`try_acquire`](Self::try_acquire). Returns `None` if
    /// the principal identified by `probe` does not hold the lock.
    fn release_all(&self, state: &AtomicU32, probe: Self::Req) -> Option<Self::Req>;

    /// Returns whether the principal identified by `probe` currently holds
    /// the lock.
    fn is_held(&self, state: &AtomicU32, probe: Self::Req) -> bool;
}

/// A blocking synchronizer over a single atomic state word.
///
/// Contenders that cannot acquire the state spin briefly and then park on a
/// FIFO queue keyed on this synchronizer's address. Releases that return
/// the state to its fully released value wake all queued contenders; each
/// re-runs its predicate and either proceeds or parks again.
pub struct QueueSynchronizer<P: SyncPolicy> {
    state: AtomicU32,
    policy: P,
}

impl<P: SyncPolicy> QueueSynchronizer<P> {
    /// Constructs a synchronizer with a released state word.
    pub fn new(policy: P) -> Self {
        Self {
            state: AtomicU32::new(0),
            policy,
        }
    }

    /// Returns the embedded policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub(crate) fn state_relaxed(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, value: u32) {
        self.state.store(value, Ordering::Relaxed);
    }

    fn queue_key(&self) -> usize {
        self as *const Self as usize
    }

    /// Wakes every queued contender. Used after a full release.
    #[cold]
    fn unpark_contenders(&self) {
        // SAFETY: the key is this synchronizer's address and the token is
        // the default one expected by the park calls below.
        unsafe {
            parking_lot_core::unpark_all(self.queue_key(), DEFAULT_UNPARK_TOKEN);
        }
    }

    /// Wakes the next queued contender. Used to propagate a shared wakeup
    /// and to hand on a wakeup absorbed by a timed-out waiter.
    #[cold]
    fn unpark_next(&self) {
        // SAFETY: as in `unpark_contenders`.
        unsafe {
            parking_lot_core::unpark_one(self.queue_key(), |_| DEFAULT_UNPARK_TOKEN);
        }
    }
}

impl<P: SharedPolicy> QueueSynchronizer<P> {
    /// Acquires in shared mode, blocking until the policy admits the
    /// request.
    #[inline]
    pub fn acquire_shared(&self, req: P::Req) {
        let hint = self.policy.try_acquire_shared(&self.state, req);
        if hint < 0 {
            self.acquire_shared_slow(req, None);
        } else if hint > 0 {
            self.unpark_next();
        }
    }

    /// Attempts a shared acquisition without blocking.
    #[inline]
    pub fn try_acquire_shared(&self, req: P::Req) -> bool {
        let hint = self.policy.try_acquire_shared(&self.state, req);
        if hint > 0 {
            self.unpark_next();
        }
        hint >= 0
    }

    /// Attempts a shared acquisition, blocking until the deadline at most.
    #[inline]
    pub fn try_acquire_shared_until(&self, req: P::Req, deadline: Instant) -> bool {
        let hint = self.policy.try_acquire_shared(&self.state, req);
        if hint >= 0 {
            if hint > 0 {
                self.unpark_next();
            }
            return true;
        }
        self.acquire_shared_slow(req, Some(deadline))
    }

    /// Releases a shared acquisition, waking queued contenders if the state
    /// became fully released. Returns `true` in that case.
    ///
    /// # Panics
    ///
    /// Panics if the policy rejects the release as mismatched.
    #[inline]
    pub fn release_shared(&self, req: P::Req) -> bool {
        if self.policy.try_release_shared(&self.state, req) {
            self.unpark_contenders();
            true
        } else {
            false
        }
    }

    #[cold]
    fn acquire_shared_slow(&self, req: P::Req, deadline: Option<Instant>) -> bool {
        let mut spin = SpinWait::new();
        loop {
            let hint = self.policy.try_acquire_shared(&self.state, req);
            if hint >= 0 {
                // A queued waiter that got in may unblock the one behind it.
                if hint > 0 {
                    self.unpark_next();
                }
                return true;
            }

            if spin.spin() {
                continue;
            }

            // The validate callback runs under the queue lock and
            // re-attempts the acquisition, so a release that raced with the
            // enqueue is never missed.
            let admitted = Cell::new(None);
            let validate = || {
                let hint = self.policy.try_acquire_shared(&self.state, req);
                if hint >= 0 {
                    admitted.set(Some(hint));
                    false
                } else {
                    true
                }
            };
            // SAFETY: the key is this synchronizer's address; the callbacks
            // only touch our atomics and never re-enter the parking lot.
            let parked = unsafe {
                parking_lot_core::park(
                    self.queue_key(),
                    validate,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    deadline,
                )
            };

            if let Some(hint) = admitted.get() {
                if hint > 0 {
                    self.unpark_next();
                }
                return true;
            }

            match parked {
                ParkResult::Unparked(_) | ParkResult::Invalid => spin.reset(),
                ParkResult::TimedOut => {
                    // Pass on a wakeup this waiter may have absorbed.
                    self.unpark_next();
                    return false;
                }
            }
        }
    }
}

impl<P: ExclusivePolicy> QueueSynchronizer<P> {
    /// Acquires in exclusive mode, blocking until the policy admits the
    /// request.
    #[inline]
    pub fn acquire(&self, req: P::Req) {
        if !self.policy.try_acquire(&self.state, req) {
            self.acquire_slow(req, None);
        }
    }

    /// Attempts an exclusive acquisition without blocking.
    #[inline]
    pub fn try_acquire(&self, req: P::Req) -> bool {
        self.policy.try_acquire(&self.state, req)
    }

    /// Attempts an exclusive acquisition, blocking until the deadline at
    /// most.
    #[inline]
    pub fn try_acquire_until(&self, req: P::Req, deadline: Instant) -> bool {
        self.policy.try_acquire(&self.state, req) || self.acquire_slow(req, Some(deadline))
    }

    /// Releases an exclusive acquisition, waking queued contenders if the
    /// state became fully released. Returns `true` in that case.
    ///
    /// # Panics
    ///
    /// Panics if the policy rejects the release as mismatched.
    #[inline]
    pub fn release(&self, req: P::Req) -> bool {
        if self.policy.try_release(&self.state, req) {
            self.unpark_contenders();
            true
        } else {
            false
        }
    }

    /// Creates a condition queue bound to this synchronizer.
    ///
    /// The `probe` request identifies the principal on whose behalf the
    /// condition operates; every condition operation requires that
    /// principal to hold the lock.
    pub fn condition(&self, probe: P::Req) -> Condition<'_, P> {
        Condition { sync: self, probe }
    }

    #[cold]
    fn acquire_slow(&self, req: P::Req, deadline: Option<Instant>) -> bool {
        let mut spin = SpinWait::new();
        loop {
            if self.policy.try_acquire(&self.state, req) {
                return true;
            }

            if spin.spin() {
                continue;
            }

            let admitted = Cell::new(false);
            let validate = || {
                if self.policy.try_acquire(&self.state, req) {
                    admitted.set(true);
                    false
                } else {
                    true
                }
            };
            // SAFETY: as in `acquire_shared_slow`.
            let parked = unsafe {
                parking_lot_core::park(
                    self.queue_key(),
                    validate,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    deadline,
                )
            };

            if admitted.get() {
                return true;
            }

            match parked {
                ParkResult::Unparked(_) | ParkResult::Invalid => spin.reset(),
                ParkResult::TimedOut => {
                    self.unpark_next();
                    return false;
                }
            }
        }
    }
}

impl<P: SyncPolicy> Debug for QueueSynchronizer<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSynchronizer")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A condition queue attached to an exclusive synchronizer.
///
/// Waiting fully releases the lock, remembering the reentrant depth, and
/// re-acquires it with the same depth before returning. Notifying moves
/// waiters over to the lock's own queue; they wake up once the notifying
/// thread releases the lock.
///
/// A condition must not be moved while threads are waiting on it; the
/// borrow a waiting thread holds enforces this.
pub struct Condition<'a, P: ExclusivePolicy> {
    sync: &'a QueueSynchronizer<P>,
    probe: P::Req,
}

impl<P: ExclusivePolicy> Condition<'_, P> {
    fn queue_key(&self) -> usize {
        self as *const Self as usize
    }

    /// Releases the lock and blocks until notified, then re-acquires the
    /// lock with the depth held before the call.
    ///
    /// # Panics
    ///
    /// Panics if the calling principal does not hold the lock.
    pub fn wait(&self) {
        self.wait_internal(None);
    }

    /// Like [`wait`](Self::wait), but gives up at the deadline.
    ///
    /// Returns `false` on timeout. The lock is re-acquired before returning
    /// in either case.
    ///
    /// # Panics
    ///
    /// Panics if the calling principal does not hold the lock.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.wait_internal(Some(deadline))
    }

    fn wait_internal(&self, deadline: Option<Instant>) -> bool {
        if !self.sync.policy.is_held(&self.sync.state, self.probe) {
            panic!("waited on a condition without holding its lock");
        }

        let saved = Cell::new(None);
        // The lock is released in the pre-sleep hook, after this thread is
        // on the condition queue, so a notification between the release and
        // the sleep cannot be lost.
        let before_sleep = || {
            if let Some(restore) = self.sync.policy.release_all(&self.sync.state, self.probe) {
                saved.set(Some(restore));
                self.sync.unpark_contenders();
            }
        };
        // SAFETY: the key is this condition's address; the pre-sleep hook
        // unparks but never parks.
        let parked = unsafe {
            parking_lot_core::park(
                self.queue_key(),
                || true,
                before_sleep,
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        let restore = saved
            .get()
            .expect("condition waiter slept without releasing its lock");
        self.sync.acquire(restore);
        !matches!(parked, ParkResult::TimedOut)
    }

    /// Moves one waiter over to the lock queue. The waiter wakes up once
    /// the lock is released.
    ///
    /// # Panics
    ///
    /// Panics if the calling principal does not hold the lock.
    pub fn notify_one(&self) {
        self.notify(RequeueOp::RequeueOne);
    }

    /// Moves all waiters over to the lock queue.
    ///
    /// # Panics
    ///
    /// Panics if the calling principal does not hold the lock.
    pub fn notify_all(&self) {
        self.notify(RequeueOp::RequeueAll);
    }

    fn notify(&self, op: RequeueOp) {
        if !self.sync.policy.is_held(&self.sync.state, self.probe) {
            panic!("notified a condition without holding its lock");
        }
        // The caller holds the lock, so the requeued waiters cannot run
        // before our eventual release wakes them.
        // SAFETY: both keys are addresses we control; the callbacks do not
        // re-enter the parking lot.
        unsafe {
            parking_lot_core::unpark_requeue(
                self.queue_key(),
                self.sync.queue_key(),
                || op,
                |_, _| DEFAULT_UNPARK_TOKEN,
            );
        }
    }
}

impl<P: ExclusivePolicy> Debug for Condition<'_, P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}

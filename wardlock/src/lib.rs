//! Synchronization primitives built on a single 32-bit state word and a
//! parked wait queue.
//!
//! The crate provides one substrate and four lock families on top of it:
//!
//! - [`QueueSynchronizer`]: an atomic state word plus a FIFO queue of
//!   parked threads, parameterized by compare-and-swap predicates. All the
//!   locks below are policies over this substrate, and new ones can be
//!   built the same way.
//! - [`ModeLock`]: a lock with read, intent-read, write and intent-write
//!   modes governed by a compatibility matrix; the write mode is reentrant
//!   and supports [`Condition`]s.
//! - [`RoomSet`] and [`NotifyingRoomSet`]: a fixed set of rooms, each a
//!   reentrant shared lock, with mutual exclusion across rooms; the
//!   notifying variant runs a handler when a room empties.
//! - [`DynamicRoomSet`]: rooms minted lazily on first request, with a
//!   choice of [`MaskStrategy`] for tolerating the growing index width.
//! - [`OwnedLock`]: a reentrant exclusive lock whose holder is an
//!   application-supplied owner value rather than the calling thread.
//!
//! All of the locks are explicitly unlocked rather than guard-based: rooms
//! and owners may legally be released by a different thread or handle than
//! the one that acquired them, which a scoped guard cannot express.
//! Mismatched releases and count overflows are programming errors and
//! panic; timed acquisitions report timeout by returning `false`.
//!
//! # Example
//!
//! ```
//! use wardlock::RoomSet;
//!
//! let rooms = RoomSet::new(["red", "blue"]);
//! let red = rooms.lock_for(&"red");
//! red.lock();
//! // Any number of parties may share "red"; "blue" has to wait.
//! assert!(rooms.lock_for(&"red").try_lock());
//! assert!(!rooms.lock_for(&"blue").try_lock());
//! red.unlock();
//! red.unlock();
//! assert!(rooms.lock_for(&"blue").try_lock());
//! ```
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod dynamic;
mod mode;
mod notify;
mod owned;
mod queue;
mod rooms;

pub use dynamic::{DynamicRoomLock, DynamicRoomPolicy, DynamicRoomSet, MaskStrategy};
pub use mode::{ModeLock, ModePolicy, SharedModeLock, WriteModeLock};
pub use notify::{NotifyingRoomLock, NotifyingRoomSet};
pub use owned::{OwnedLock, OwnedRequest, OwnerLock, OwnerPolicy};
pub use queue::{Condition, ExclusivePolicy, QueueSynchronizer, SharedPolicy, SyncPolicy};
pub use rooms::{RoomLock, RoomPolicy, RoomSet};

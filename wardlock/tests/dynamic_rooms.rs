use crossbeam_utils::sync::WaitGroup;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use wardlock::{DynamicRoomSet, MaskStrategy};

#[test]
fn smoke() {
    let set = DynamicRoomSet::new();
    let a = set.lock_for("a");
    a.lock();
    a.unlock();
    assert_eq!(set.rooms_registered(), 1);
    assert!(!set.is_occupied());
}

/// Threads keep minting fresh rooms while locking them, so the index mask
/// widens continuously under the running acquisitions. No schedule may let
/// two rooms hold the set at once.
fn exclusion_under_concurrent_registration(strategy: MaskStrategy) {
    const THREADS: u32 = 4;
    const ROUNDS: u32 = 100;

    let set = DynamicRoomSet::with_strategy(strategy);
    let occupied = AtomicU32::new(0);

    thread::scope(|s| {
        let wg = WaitGroup::new();
        for worker in 0..THREADS {
            let wg = wg.clone();
            let set = &set;
            let occupied = &occupied;
            s.spawn(move || {
                wg.wait();
                for round in 0..ROUNDS {
                    let tag = worker * ROUNDS + round + 1;
                    let room = set.lock_for((worker, round));
                    room.lock();
                    let previous = occupied.swap(tag, Ordering::SeqCst);
                    assert_eq!(previous, 0, "two rooms were occupied at once");
                    occupied.store(0, Ordering::SeqCst);
                    room.unlock();
                }
            });
        }
    });

    assert_eq!(set.rooms_registered(), THREADS * ROUNDS);
    assert!(!set.is_occupied());
}

#[test]
fn revalidate_strategy_excludes_rooms_while_registering() {
    exclusion_under_concurrent_registration(MaskStrategy::Revalidate);
}

#[test]
fn reload_strategy_excludes_rooms_while_registering() {
    exclusion_under_concurrent_registration(MaskStrategy::Reload);
}

#[test]
fn one_shot_strategy_excludes_rooms_while_registering() {
    exclusion_under_concurrent_registration(MaskStrategy::OneShot);
}

#[test]
fn co_occupants_share_a_minted_room() {
    let set = DynamicRoomSet::new();
    let trying = AtomicU32::new(0);

    let a = set.lock_for("a");
    a.lock();

    thread::scope(|s| {
        let set = &set;
        let trying = &trying;
        s.spawn(move || {
            // The same key shares the room even through a fresh handle.
            let also_a = set.lock_for("a");
            assert!(also_a.try_lock());
            also_a.unlock();

            let b = set.lock_for("b");
            trying.store(1, Ordering::Release);
            b.lock();
            b.unlock();
        });

        while trying.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        a.unlock();
    });

    assert!(!set.is_occupied());
}

//! Loom models of the map's two lock-free protocols.
//!
//! Loom explores all interleavings of a small model, which catches ordering
//! bugs random stress cannot. The models mirror the protocol shapes rather
//! than instrumenting the real tree: the state-word spinlock, the
//! release-publish / fence-acquire slot handshake, and the CAS push stack
//! of the reclamation queue.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib map::loom_tests`

use loom::sync::Arc;
use loom::sync::atomic::{AtomicU32, AtomicUsize, fence};
use loom::thread;
use std::sync::atomic::Ordering;

const LOCKED: u32 = 1 << 31;

/// Minimal state-word lock, as in `NodeState::lock`.
fn lock(state: &AtomicU32) {
    loop {
        let s = state.load(Ordering::Relaxed);
        if s & LOCKED == 0
            && state
                .compare_exchange_weak(s, s | LOCKED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }
        thread::yield_now();
    }
}

fn unlock(state: &AtomicU32) {
    let s = state.load(Ordering::Relaxed);
    state.store(s & !LOCKED, Ordering::Release);
}

#[test]
fn state_word_lock_is_mutually_exclusive() {
    loom::model(|| {
        let state = Arc::new(AtomicU32::new(0));
        let shared = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    lock(&state);
                    // Plain read-modify-write under the lock: any
                    // interleaving inside here is a mutual-exclusion bug.
                    let v = shared.load(Ordering::Relaxed);
                    shared.store(v + 1, Ordering::Relaxed);
                    unlock(&state);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.load(Ordering::Relaxed), 2);
    });
}

#[test]
fn slot_publish_pairs_with_hop_fence() {
    loom::model(|| {
        // "Leaf contents" and the slot word that publishes them.
        let leaf_val = Arc::new(AtomicUsize::new(0));
        let slot_word = Arc::new(AtomicUsize::new(0));

        let writer = {
            let leaf_val = Arc::clone(&leaf_val);
            let slot_word = Arc::clone(&slot_word);
            thread::spawn(move || {
                leaf_val.store(0xabc, Ordering::Relaxed);
                // node_insert publishes with a release store.
                slot_word.store(1, Ordering::Release);
            })
        };

        // Reader side: relaxed slot load, then the hop fence, then the
        // leaf fields.
        let observed = slot_word.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if observed != 0 {
            assert_eq!(leaf_val.load(Ordering::Relaxed), 0xabc);
        }

        writer.join().unwrap();
    });
}

#[test]
fn link_fence_publishes_the_child_contents() {
    loom::model(|| {
        // Expansion: the child's slot is written first, then a release
        // fence, then the plain parent-slot store.
        let child_slot = Arc::new(AtomicUsize::new(0));
        let parent_slot = Arc::new(AtomicUsize::new(0));

        let writer = {
            let child_slot = Arc::clone(&child_slot);
            let parent_slot = Arc::clone(&parent_slot);
            thread::spawn(move || {
                child_slot.store(0x51, Ordering::Relaxed);
                fence(Ordering::Release);
                parent_slot.store(1, Ordering::Relaxed);
            })
        };

        let seen = parent_slot.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if seen != 0 {
            assert_eq!(child_slot.load(Ordering::Relaxed), 0x51);
        }

        writer.join().unwrap();
    });
}

#[test]
fn gc_stack_push_never_loses_an_entry() {
    loom::model(|| {
        // Model the stage stack as CAS-pushed "next" indices: slot i holds
        // the previous head, head holds the newest index + 1.
        let head = Arc::new(AtomicUsize::new(0));
        let links = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let head = Arc::clone(&head);
                let links = Arc::clone(&links);
                thread::spawn(move || {
                    let mut h = head.load(Ordering::Relaxed);
                    loop {
                        links[i].store(h, Ordering::Relaxed);
                        match head.compare_exchange_weak(
                            h,
                            i + 1,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => break,
                            Err(seen) => h = seen,
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Drain: both entries must be reachable from the head.
        let mut seen = Vec::new();
        let mut cursor = head.swap(0, Ordering::Acquire);
        while cursor != 0 {
            seen.push(cursor - 1);
            cursor = links[cursor - 1].load(Ordering::Relaxed);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);
    });
}

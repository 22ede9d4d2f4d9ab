//! Deferred reclamation queue.
//!
//! Deletion must not free memory a lock-free reader may still be walking,
//! so writers *stage* `(addr, len)` pairs on a lock-free stack and the
//! caller drains it once it has established quiescence. Queue nodes come
//! from the process heap, never from the injected allocator: the queue is
//! private to the owning process even when the map region is shared.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// One staged region.
struct GcEntry {
    addr: usize,
    len: usize,
    next: *mut GcEntry,
}

/// Lock-free stack of staged regions.
pub(crate) struct GcList {
    head: AtomicPtr<GcEntry>,
}

impl GcList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Stage a region. Called by writers after unlinking memory.
    pub(crate) fn push(&self, addr: usize, len: usize) {
        let entry = Box::into_raw(Box::new(GcEntry {
            addr,
            len,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: entry is ours until the CAS below succeeds.
            unsafe { (*entry).next = head };

            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Detach the whole stack and hand each staged region to `f`.
    ///
    /// The swap makes draining single-consumer by construction: entries
    /// detached here can no longer be observed through the list.
    pub(crate) fn drain(&self, mut f: impl FnMut(usize, usize)) {
        let mut entry = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        while !entry.is_null() {
            // SAFETY: the entry was detached by the swap above; nothing
            // else can reach it, and it was created by `Box::into_raw`.
            let boxed = unsafe { Box::from_raw(entry) };
            f(boxed.addr, boxed.len);
            entry = boxed.next;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl Drop for GcList {
    fn drop(&mut self) {
        // Free surviving queue nodes. The staged regions themselves belong
        // to whoever owns the allocator; the map drains before dropping.
        self.drain(|_, _| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_sees_pushes_lifo() {
        let list = GcList::new();
        list.push(0x10, 1);
        list.push(0x20, 2);
        list.push(0x30, 3);

        let mut seen = Vec::new();
        list.drain(|addr, len| seen.push((addr, len)));

        assert_eq!(seen, vec![(0x30, 3), (0x20, 2), (0x10, 1)]);
        assert!(list.is_empty());
    }

    #[test]
    fn drain_on_empty_is_a_noop() {
        let list = GcList::new();
        let mut called = false;
        list.drain(|_, _| called = true);
        assert!(!called);
    }

    #[test]
    fn stack_is_empty_after_drain_even_with_interleaved_pushes() {
        let list = GcList::new();
        list.push(1, 1);
        list.drain(|_, _| {});
        list.push(2, 2);

        let mut seen = Vec::new();
        list.drain(|addr, _| seen.push(addr));
        assert_eq!(seen, vec![2]);
    }

    #[test]
    fn concurrent_pushes_are_all_drained() {
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;

        let list = Arc::new(GcList::new());
        let mut handles = Vec::new();

        for t in 0..THREADS {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    list.push(t * PER_THREAD + i + 1, 8);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = Vec::new();
        list.drain(|addr, _| seen.push(addr));

        assert_eq!(seen.len(), THREADS * PER_THREAD);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}

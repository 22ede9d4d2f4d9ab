//! The concurrent trie-hash map.
//!
//! Lookups descend from the root guided by the hash cursor and never take
//! locks; each parent-to-child hop carries an acquire fence that pairs with
//! the release a writer issued when it published the child. Writers lock
//! only the *edge node*, the deepest node on a key's path, and re-check
//! it after locking; a node that was concurrently deleted or a slot that
//! grew an interior node sends the writer back to the root.
//!
//! Collisions expand the tree one level at a time: the writer builds a new,
//! already-locked child containing the colliding leaf, publishes it with a
//! release fence, and moves its lock one level down. Deletions reverse the
//! process, collapsing empty nodes bottom-up while holding the lock of the
//! node above, and stage unlinked memory on the reclamation queue instead
//! of freeing it.
//!
//! # Write protocol
//!
//! ```text
//! put(key, val):
//! 1. leaf = leaf_create(key, val)          // private; OOM surfaces here
//! 2. edge = find_edge_node_locked(key)     // lock + deleted/expanded re-check
//! 3. empty slot      -> insert leaf, unlock
//!    equal key       -> free leaf, return existing, unlock
//!    colliding leaf  -> loop: child = node_create (locked),
//!                      child[slot(other)] = other, release fence,
//!                      parent[slot] = child, unlock parent, descend
//! ```

use std::alloc::Layout;
use std::fmt;
use std::ptr;
use std::sync::atomic::fence;

use crate::alloc::{ALLOC_ALIGN, HeapOps, MemOps};
use crate::gc::GcList;
use crate::hash::Query;
use crate::leaf::{LEAF_LEN, LeafRef};
use crate::node::{LEVEL_FANOUT, LEVEL_LEN, NodeRef, ROOT_FANOUT, ROOT_LEN};
use crate::ordering::{HOP_FENCE, LINK_FENCE, SLOT_READ, SLOT_WRITE};
use crate::slot;
use crate::state::NodeState;
use crate::tracing_helpers::{debug_log, trace_log};

#[cfg(all(loom, test))]
mod loom_tests;

/// Keys are not copied into the map; the caller's pointer is stored
/// verbatim and must outlive the entry. Part of [`ThMap::create`]'s safety
/// contract.
pub const NOCOPY: u32 = 1 << 0;

const ROOT_LAYOUT: Layout = match Layout::from_size_align(ROOT_LEN, ALLOC_ALIGN) {
    Ok(layout) => layout,
    Err(_) => panic!("root layout"),
};

// ============================================================================
//  Errors
// ============================================================================

/// Errors surfaced by [`ThMap::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    /// The base address has one of its two low bits set, which the tag
    /// discipline reserves.
    MisalignedBase,

    /// The allocator could not produce the root node.
    AllocationFailed,
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedBase => write!(f, "base address is not 4-byte aligned"),
            Self::AllocationFailed => write!(f, "root node allocation failed"),
        }
    }
}

impl std::error::Error for CreateError {}

/// Errors surfaced by [`ThMap::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// The allocator ran out of memory for the leaf, the key copy, or an
    /// interior node mid-expansion. Partial allocations were released.
    AllocationFailed,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed => write!(f, "memory allocation failed"),
        }
    }
}

impl std::error::Error for InsertError {}

// ============================================================================
//  ThMap
// ============================================================================

/// A concurrent trie-hash map over caller-provided memory.
///
/// Keys are arbitrary byte strings, values opaque machine words. Lookups
/// are lock-free; inserts and deletes serialize per interior node through
/// spinlocks packed into each node's state word. All internal references
/// are offsets from `base`, so the node region may be shared memory mapped
/// at different addresses in cooperating processes (the handle itself is a
/// plain process-local struct).
///
/// # Example
///
/// ```
/// use thmap::ThMap;
///
/// let map = ThMap::new();
/// assert_eq!(map.put(b"apple", 0x1), Ok(0x1));
/// assert_eq!(map.get(b"apple"), Some(0x1));
/// assert_eq!(map.get(b"pear"), None);
/// ```
pub struct ThMap<O: MemOps = HeapOps> {
    base: usize,
    root: usize,
    flags: u32,
    ops: O,
    gc: GcList,
}

/// Result of locating the edge node for a key.
#[derive(Clone, Copy)]
struct Edge {
    node: NodeRef,
    slot: usize,
    word: usize,
}

impl ThMap<HeapOps> {
    /// Map over the process heap: base 0, keys copied.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: base 0 with the heap ops satisfies the create contract,
        // and no flags means no caller-side key obligations.
        unsafe { Self::create(0, HeapOps, 0) }
            .unwrap_or_else(|_| std::alloc::handle_alloc_error(ROOT_LAYOUT))
    }
}

impl Default for ThMap<HeapOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: MemOps> ThMap<O> {
    /// Construct a map over a caller-provided address range.
    ///
    /// `base` is the address all internal offsets are relative to; with
    /// [`HeapOps`] it is 0 and offsets are plain addresses. The root node
    /// is allocated through `ops` immediately.
    ///
    /// # Safety
    ///
    /// - Every word `ops.alloc` returns must resolve to memory readable and
    ///   writable at `base + word` for the allocation's length, for as long
    ///   as the map (or a staged region) lives.
    /// - With [`NOCOPY`] in `flags`, every key passed to [`Self::put`] must
    ///   outlive its entry in the map.
    ///
    /// # Errors
    ///
    /// [`CreateError::MisalignedBase`] if `base` has either of its low two
    /// bits set; [`CreateError::AllocationFailed`] if the root cannot be
    /// allocated.
    pub unsafe fn create(base: usize, ops: O, flags: u32) -> Result<Self, CreateError> {
        if !slot::is_aligned(base) {
            return Err(CreateError::MisalignedBase);
        }

        let root = ops.alloc(ROOT_LEN);
        if root == 0 {
            return Err(CreateError::AllocationFailed);
        }
        assert!(slot::is_aligned(root), "allocator returned a tagged word");

        let map = Self {
            base,
            root,
            flags,
            ops,
            gc: GcList::new(),
        };
        // SAFETY: fresh allocation of ROOT_LEN bytes, private to us. A
        // zeroed state word is unlocked and empty.
        unsafe { map.node_at(root).zero(ROOT_FANOUT) };
        Ok(map)
    }

    // ========================================================================
    //  Offset translation
    // ========================================================================

    #[inline]
    fn ptr_of(&self, off: usize) -> *mut u8 {
        self.base.wrapping_add(off) as *mut u8
    }

    #[inline]
    fn off_of(&self, p: *mut u8) -> usize {
        (p as usize).wrapping_sub(self.base)
    }

    #[inline]
    fn node_at(&self, word: usize) -> NodeRef {
        NodeRef::from_ptr(self.ptr_of(slot::untag(word)))
    }

    #[inline]
    fn leaf_at(&self, word: usize) -> LeafRef {
        LeafRef::from_ptr(self.ptr_of(slot::untag(word)))
    }

    #[inline]
    fn root_node(&self) -> NodeRef {
        self.node_at(self.root)
    }

    // ========================================================================
    //  Keys and leaves
    // ========================================================================

    /// The key bytes a leaf refers to.
    ///
    /// # Safety
    /// The leaf must be live, and under [`NOCOPY`] the caller's key buffer
    /// must still be (create contract).
    unsafe fn key_bytes<'a>(&self, leaf: LeafRef) -> &'a [u8] {
        // SAFETY: live leaf per caller contract; the key reference is a
        // verbatim caller pointer in no-copy mode, an offset otherwise.
        unsafe {
            let word = leaf.key_word();
            let len = leaf.key_len();
            let p = if self.flags & NOCOPY != 0 {
                word as *const u8
            } else {
                self.ptr_of(word).cast_const()
            };
            std::slice::from_raw_parts(p, len)
        }
    }

    /// # Safety
    /// As [`Self::key_bytes`].
    #[inline]
    unsafe fn key_matches(&self, leaf: LeafRef, key: &[u8]) -> bool {
        // SAFETY: forwarded contract.
        unsafe { self.key_bytes(leaf) == key }
    }

    /// Allocate and fill a leaf; copies the key unless the map is no-copy.
    fn leaf_create(&self, key: &[u8], val: usize) -> Option<LeafRef> {
        let leaf_off = self.ops.alloc(LEAF_LEN);
        if leaf_off == 0 {
            return None;
        }
        assert!(slot::is_aligned(leaf_off), "allocator returned a tagged word");

        let key_word = if self.flags & NOCOPY == 0 {
            let key_off = self.ops.alloc(key.len());
            if key_off == 0 {
                self.ops.free(leaf_off, LEAF_LEN);
                return None;
            }
            // SAFETY: fresh allocation of key.len() bytes.
            unsafe { ptr::copy_nonoverlapping(key.as_ptr(), self.ptr_of(key_off), key.len()) };
            key_off
        } else {
            key.as_ptr() as usize
        };

        let leaf = self.leaf_at(leaf_off);
        // SAFETY: fresh, still-private leaf allocation.
        unsafe { leaf.init(key_word, key.len(), val) };
        Some(leaf)
    }

    /// Synchronously free a leaf that was never published (or is being torn
    /// down with exclusive access). Returns the stored value.
    ///
    /// # Safety
    /// The leaf must be live and unreachable by any other thread.
    unsafe fn leaf_free(&self, leaf: LeafRef) -> usize {
        // SAFETY: exclusive leaf per caller contract.
        unsafe {
            let val = leaf.val();
            if self.flags & NOCOPY == 0 {
                self.ops.free(leaf.key_word(), leaf.key_len());
            }
            self.ops.free(self.off_of(leaf.as_ptr()), LEAF_LEN);
            val
        }
    }

    /// Allocate a level node, owned (locked) by the caller.
    fn node_create(&self, parent: NodeRef) -> Option<NodeRef> {
        let off = self.ops.alloc(LEVEL_LEN);
        if off == 0 {
            return None;
        }
        assert!(slot::is_aligned(off), "allocator returned a tagged word");

        let node = self.node_at(off);
        // SAFETY: fresh LEVEL_LEN allocation, private until linked.
        unsafe {
            node.zero(LEVEL_FANOUT);
            node.state().init_locked();
            node.set_parent(self.off_of(parent.as_ptr()));
        }
        Some(node)
    }

    // ========================================================================
    //  Traversal
    // ========================================================================

    /// Lock-free descent to the edge node for `key`.
    ///
    /// Returns the deepest node on the key's path together with the slot
    /// index and the slot word observed under the final acquire fence.
    fn find_edge_node(&self, query: &mut Query, key: &[u8]) -> Edge {
        debug_assert_eq!(query.level(), 0);

        let mut parent = self.root_node();
        let mut slot_idx = query.slot(key);
        // SAFETY: the root is live for the life of the map.
        let mut word = unsafe { parent.slot(slot_idx).load(SLOT_READ) };

        while word != slot::EMPTY && slot::is_inode(word) {
            query.descend();
            slot_idx = query.slot(key);
            parent = self.node_at(word);

            // The parent's slot load must happen before the child's.
            fence(HOP_FENCE);
            // SAFETY: interior words reference nodes that stay live until
            // the caller-quiesced gc (create/gc contracts).
            word = unsafe { parent.slot(slot_idx).load(SLOT_READ) };
        }
        // Pairs with the release that published whatever `word` names.
        fence(HOP_FENCE);

        Edge {
            node: parent,
            slot: slot_idx,
            word,
        }
    }

    /// Descend, lock the edge node, and re-validate it.
    ///
    /// The tree may change shape between the lock-free descent and the lock
    /// acquisition; a deleted edge or a slot that grew an interior node
    /// restarts the whole walk from the root.
    fn find_edge_node_locked(&self, query: &mut Query, key: &[u8]) -> Edge {
        loop {
            let edge = self.find_edge_node(query, key);
            // SAFETY: edge nodes stay live until caller-quiesced gc.
            let state = unsafe { edge.node.state() };
            state.lock();

            if state.is_deleted() {
                state.unlock();
                query.restart();
                trace_log!("edge node deleted under us, restarting");
                continue;
            }

            // SAFETY: slot index came from the cursor, within fanout.
            let word = unsafe { edge.node.slot(edge.slot).load(SLOT_READ) };
            if word != slot::EMPTY && slot::is_inode(word) {
                // A concurrent insert expanded this slot.
                state.unlock();
                query.restart();
                trace_log!("edge slot expanded under us, restarting");
                continue;
            }

            return Edge { word, ..edge };
        }
    }

    // ========================================================================
    //  Operations
    // ========================================================================

    /// Look up the value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<usize> {
        let mut query = Query::new();
        let edge = self.find_edge_node(&mut query, key);

        if slot::is_inode(edge.word) {
            // Empty slot; an interior word cannot escape the descent loop.
            return None;
        }

        let leaf = self.leaf_at(edge.word);
        // SAFETY: the final fence in find_edge_node pairs with the release
        // that published this leaf, and staged leaves outlive readers by
        // the gc quiescence contract.
        unsafe {
            if !self.key_matches(leaf, key) {
                return None;
            }
            Some(leaf.val())
        }
    }

    /// Insert `val` under `key`.
    ///
    /// On a fresh insert the passed `val` is returned; if the key is
    /// already present the *existing* value is returned instead and the map
    /// is unchanged. Callers distinguish the two by comparing against the
    /// argument.
    ///
    /// # Errors
    ///
    /// [`InsertError::AllocationFailed`] if the leaf, the key copy, or an
    /// interior node mid-expansion cannot be allocated; partial allocations
    /// are released before returning.
    pub fn put(&self, key: &[u8], val: usize) -> Result<usize, InsertError> {
        let mut query = Query::new();

        // Pre-allocate and initialise the leaf. The edge lock CAS below is
        // a release, so the leaf's contents are ordered before any slot
        // store performed under that lock.
        let Some(leaf) = self.leaf_create(key, val) else {
            return Err(InsertError::AllocationFailed);
        };
        let leaf_word = slot::tag_leaf(self.off_of(leaf.as_ptr()));

        let edge = self.find_edge_node_locked(&mut query, key);
        let mut parent = edge.node;
        let mut slot_idx = edge.slot;

        if edge.word == slot::EMPTY {
            // SAFETY: parent is locked and the slot was empty under the lock.
            unsafe {
                parent.insert(slot_idx, leaf_word);
                parent.state().unlock();
            }
            return Ok(val);
        }

        // Occupied: either our key (duplicate) or a colliding leaf.
        let other_word = edge.word;
        let other = self.leaf_at(other_word);
        // SAFETY: `other` was published under this node's lock chain and
        // cannot be retired while we hold the lock.
        if unsafe { self.key_matches(other, key) } {
            // Duplicate: the present value wins; drop the pre-allocated leaf.
            unsafe {
                let existing = other.val();
                self.leaf_free(leaf);
                parent.state().unlock();
                return Ok(existing);
            }
        }

        // Collision: grow a level at a time until the two keys part ways.
        loop {
            let Some(child) = self.node_create(parent) else {
                // SAFETY: parent is locked by us; the leaf is still private.
                unsafe {
                    self.leaf_free(leaf);
                    parent.state().unlock();
                }
                return Err(InsertError::AllocationFailed);
            };
            query.descend();

            // Place the colliding leaf into the still-private child.
            let other_slot = {
                // SAFETY: `other` stays live while we hold the lock chain.
                let other_key = unsafe { self.key_bytes(other) };
                Query::at_level(query.level()).slot(other_key)
            };
            // SAFETY: child is private and locked; slot is empty.
            unsafe { child.insert(other_slot, other_word) };

            trace_log!(level = query.level(), "collision, expanding a level");

            // The child and the leaf it carries must reach global
            // visibility before the link below; the link itself is a plain
            // store and leaves the parent's count untouched (the slot
            // held `other` before).
            fence(LINK_FENCE);
            // SAFETY: parent is locked; the slot still holds `other_word`.
            unsafe {
                parent
                    .slot(slot_idx)
                    .store(self.off_of(child.as_ptr()), SLOT_WRITE);
                parent.state().unlock();
                debug_assert!(child.state().is_locked());
            }
            parent = child;

            slot_idx = query.slot(key);
            if slot_idx == other_slot {
                // Still colliding at this level; expand again.
                continue;
            }

            // SAFETY: parent (the fresh child) is locked; the slot is empty.
            unsafe {
                parent.insert(slot_idx, leaf_word);
                parent.state().unlock();
            }
            return Ok(val);
        }
    }

    /// Remove `key`, returning the value it stored.
    pub fn del(&self, key: &[u8]) -> Option<usize> {
        let mut query = Query::new();
        let edge = self.find_edge_node_locked(&mut query, key);
        let mut parent = edge.node;

        if !slot::is_inode(edge.word) {
            let leaf = self.leaf_at(edge.word);

            // SAFETY: leaf published under this node's lock chain; parent
            // locked for the removal; collapse locks hand-over-hand.
            unsafe {
                if !self.key_matches(leaf, key) {
                    parent.state().unlock();
                    return None;
                }

                parent.remove(edge.slot);

                // Collapse the levels emptied by this removal.
                while query.level() > 0 && parent.state().count() == 0 {
                    let node = parent;
                    debug_assert_eq!(node.state().raw(), NodeState::INITIAL_LOCKED);

                    // Ascend one level: lock the node above, mark ours
                    // deleted, then unlink it.
                    query.ascend();
                    let up_slot = query.slot(key);
                    let up = self.node_at(node.parent_off());

                    up.state().lock();
                    debug_assert!(!up.state().is_deleted());

                    node.state().set_deleted();
                    node.state().unlock();

                    debug_assert_eq!(
                        up.slot(up_slot).load(SLOT_READ),
                        self.off_of(node.as_ptr())
                    );
                    up.remove(up_slot);

                    self.gc.push(self.off_of(node.as_ptr()), LEVEL_LEN);
                    debug_log!(level = query.level(), "collapsed an emptied level");

                    parent = up;
                }
                parent.state().unlock();

                // Save the value, then stage the leaf (and the owned key
                // copy) for caller-quiesced reclamation.
                let val = leaf.val();
                if self.flags & NOCOPY == 0 {
                    self.gc.push(leaf.key_word(), leaf.key_len());
                }
                self.gc.push(self.off_of(leaf.as_ptr()), LEAF_LEN);
                return Some(val);
            }
        }

        // Empty slot: nothing stored under this key.
        // SAFETY: we hold the lock taken in find_edge_node_locked.
        unsafe { parent.state().unlock() };
        None
    }

    /// Free every region staged by deletions.
    ///
    /// # Safety
    ///
    /// The caller must have established quiescence: no thread may still be
    /// executing a lookup or mutation that started before the staged
    /// regions were unlinked. Dropping the map runs this automatically
    /// (exclusive access is quiescence).
    pub unsafe fn gc(&self) {
        let mut drained: usize = 0;
        self.gc.drain(|addr, len| {
            self.ops.free(addr, len);
            drained += 1;
        });

        if drained > 0 {
            debug_log!(drained, "gc drained staged regions");
        }
    }

    // ========================================================================
    //  Teardown
    // ========================================================================

    /// Free every leaf, key copy and interior node reachable from `node`.
    ///
    /// # Safety
    /// Exclusive access to the map.
    unsafe fn teardown(&self, node: NodeRef, fanout: usize) {
        for i in 0..fanout {
            // SAFETY: exclusive access; all reachable records are live.
            unsafe {
                let word = node.slot(i).load(SLOT_READ);
                if word == slot::EMPTY {
                    continue;
                }
                if slot::is_inode(word) {
                    let child = self.node_at(word);
                    self.teardown(child, LEVEL_FANOUT);
                    self.ops.free(slot::untag(word), LEVEL_LEN);
                } else {
                    self.leaf_free(self.leaf_at(word));
                }
            }
        }
    }

    // ========================================================================
    //  Test support
    // ========================================================================

    /// Walk the reachable tree and assert the structural invariants: slot
    /// counts match, no deleted node is reachable, and every leaf sits on
    /// the slot its key hashes to. Requires quiescence.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        // SAFETY: tests call this at quiescent points.
        unsafe { self.check_node(self.root_node(), ROOT_FANOUT, 0) };
    }

    #[cfg(test)]
    unsafe fn check_node(&self, node: NodeRef, fanout: usize, level: u32) {
        // SAFETY: quiescence per check_invariants.
        unsafe {
            assert!(!node.state().is_deleted(), "reachable node marked deleted");

            let mut occupied: u32 = 0;
            for i in 0..fanout {
                let word = node.slot(i).load(SLOT_READ);
                if word == slot::EMPTY {
                    continue;
                }
                occupied += 1;

                if slot::is_inode(word) {
                    self.check_node(self.node_at(word), LEVEL_FANOUT, level + 1);
                } else {
                    let leaf = self.leaf_at(word);
                    let key = self.key_bytes(leaf);
                    let expected = Query::at_level(level).slot(key);
                    assert_eq!(i, expected, "leaf parked on the wrong slot");
                }
            }

            assert_eq!(node.state().count(), occupied, "slot count out of sync");
        }
    }

    #[cfg(test)]
    pub(crate) fn staged_is_empty(&self) -> bool {
        self.gc.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn root_off(&self) -> usize {
        self.root
    }
}

impl<O: MemOps> Drop for ThMap<O> {
    fn drop(&mut self) {
        // Exclusive access is quiescence, so draining and walking are safe
        // here: no reader can still observe any of this memory.
        // SAFETY: see above.
        unsafe {
            self.gc();
            self.teardown(self.root_node(), ROOT_FANOUT);
        }
        self.ops.free(self.root, ROOT_LEN);
    }
}

impl<O: MemOps> fmt::Debug for ThMap<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThMap")
            .field("base", &self.base)
            .field("root", &self.root)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

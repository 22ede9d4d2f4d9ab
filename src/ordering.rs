//! Memory orderings for the traversal and mutation protocol.
//!
//! Named constants keep the pairing contract in one place and make the
//! intent clear at each access point.
//!
//! The protocol is fence-based on the read side: a traversing reader loads
//! slot words relaxed and emits an acquire fence on every parent-to-child
//! hop (plus a final one before touching the leaf). Writers pair with that
//! in two ways:
//!
//! - a leaf is published into an empty slot with a release store;
//! - a freshly built interior node is published with an explicit release
//!   fence followed by a plain store, because the fence must also cover the
//!   node's non-atomic fields (the parent offset) and the colliding leaf
//!   already linked inside it.

use std::sync::atomic::Ordering;

/// Loads of slot words during lock-free descent. The per-hop acquire fence
/// ([`HOP_FENCE`]) supplies the synchronization, not the load itself.
pub(crate) const SLOT_READ: Ordering = Ordering::Relaxed;

/// The per-hop (and final) reader fence. Pairs with [`SLOT_PUBLISH`] and
/// with the release fence writers emit before linking a new interior node.
pub(crate) const HOP_FENCE: Ordering = Ordering::Acquire;

/// Publishing a leaf into an empty slot. Pairs with [`HOP_FENCE`] so a
/// reader that observes the slot word also observes the leaf's contents.
pub(crate) const SLOT_PUBLISH: Ordering = Ordering::Release;

/// The fence emitted before linking a freshly built interior node into its
/// parent; the store itself is then plain.
pub(crate) const LINK_FENCE: Ordering = Ordering::Release;

/// Slot stores that do not publish new memory (clearing on remove, the
/// post-fence interior link).
pub(crate) const SLOT_WRITE: Ordering = Ordering::Relaxed;

/// Successful lock CAS. Acquire for what follows the lock, release for
/// whatever the previous owner stored.
pub(crate) const LOCK_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed lock CAS: only needs the current value.
pub(crate) const LOCK_FAILURE: Ordering = Ordering::Relaxed;

/// Unlock store. Everything written under the lock becomes visible before
/// the cleared state word does.
pub(crate) const UNLOCK: Ordering = Ordering::Release;

/// State-word accesses under the lock (count bumps, the deleted bit).
/// Readers never inspect the state word, and writers synchronize through
/// the lock itself.
pub(crate) const STATE_RELAXED: Ordering = Ordering::Relaxed;

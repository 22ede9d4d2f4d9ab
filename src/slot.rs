//! Slot-word encoding.
//!
//! Every slot in an interior node is a single machine word holding a
//! base-relative offset with the low bit reserved as a tag:
//!
//! - whole word zero: the slot is empty;
//! - low bit set: the slot holds a leaf (offset is `word & !3`);
//! - low bit clear (nonzero): the slot holds an interior node.
//!
//! Because everything is an offset from the map base, the same map can be
//! mapped at different virtual addresses in cooperating processes. The tag
//! scheme requires every allocation to leave the low two bits free, which
//! [`is_aligned`] checks and the allocation paths assert.

/// Tag bit marking a slot word as a leaf reference.
pub(crate) const LEAF_BIT: usize = 0x1;

/// Mask clearing both tag bits from a slot word.
const TAG_MASK: usize = 0x3;

/// An empty slot.
pub(crate) const EMPTY: usize = 0;

/// Whether a word refers to an interior node (or is empty).
///
/// Only leaves are tagged, so a zero word also reports "interior" here;
/// callers that care test for [`EMPTY`] first.
#[inline]
#[must_use]
pub(crate) const fn is_inode(word: usize) -> bool {
    word & LEAF_BIT == 0
}

/// Strip the tag bits, leaving the bare offset.
#[inline]
#[must_use]
pub(crate) const fn untag(word: usize) -> usize {
    word & !TAG_MASK
}

/// Whether an offset or address leaves the two tag bits free.
#[inline]
#[must_use]
pub(crate) const fn is_aligned(word: usize) -> bool {
    word & TAG_MASK == 0
}

/// Tag a leaf offset for storage in a slot.
#[inline]
#[must_use]
pub(crate) const fn tag_leaf(off: usize) -> usize {
    debug_assert!(is_aligned(off));
    off | LEAF_BIT
}

//! # thmap
//!
//! A concurrent trie-hash map: byte-string keys, opaque word values,
//! lock-free lookups and fine-grained per-node locking for writers.
//!
//! The trie is indexed by the key's hash (six bits at the 64-way root,
//! four bits per 16-way level below) and grows or shrinks levels only
//! where keys actually collide. Every internal reference is an offset from
//! a caller-provided base address and all memory comes from an injected
//! two-function allocator, so the whole structure can live in shared
//! memory mapped at different addresses in cooperating processes.
//!
//! ## Design
//!
//! - Readers descend without locks, pairing acquire fences with the
//!   release stores writers use to publish slots.
//! - Writers lock one node at a time (a bit in each node's state word);
//!   inserts expand colliding slots a level at a time, deletes collapse
//!   emptied levels bottom-up.
//! - Deleted memory is *staged* on a lock-free queue and only freed when
//!   the caller (or the destructor) declares quiescence via [`ThMap::gc`].
//!
//! ## Example
//!
//! ```
//! use thmap::ThMap;
//!
//! let map = ThMap::new();
//! assert_eq!(map.put(b"apple", 0x1), Ok(0x1));
//! assert_eq!(map.get(b"apple"), Some(0x1));
//! assert_eq!(map.del(b"apple"), Some(0x1));
//! assert_eq!(map.get(b"apple"), None);
//! ```

pub mod alloc;
pub mod hash;

mod gc;
mod leaf;
mod map;
mod node;
mod ordering;
mod slot;
mod state;
mod tracing_helpers;

pub use alloc::{ArenaOps, HeapOps, MemOps};
pub use map::{CreateError, InsertError, NOCOPY, ThMap};

//! # dmt-rs
//!
//! The in-memory leaf layer of a write-optimized (fractal-tree-style)
//! index: a dual-mode order-maintenance container and the basement-node
//! key/value layer built on it.
//!
//! - [`Mempool`]: offset-addressed arena; every cross-node reference is
//!   a `u32` offset, never a raw pointer, so storage can be grown or
//!   rebuilt without chasing addresses.
//! - [`Dmt`]: an ordered sequence of opaque values that is a packed
//!   array while insertions are same-length tail appends, and a
//!   weight-balanced tree stored in the arena otherwise. Searches go
//!   through caller-supplied heaviside functions, so the container
//!   never learns key semantics.
//! - [`DmtBuilder`]: append-only construction from a pre-sorted stream,
//!   with a single balancing pass at the end.
//! - [`BasementNode`]: maps arbitrary-length keys to variable-length
//!   payload records using one `Dmt` of key+offset pairs plus a second
//!   arena for the payload bytes, with split, clone, and a versioned
//!   serialized form.
//!
//! Every instance is single-threaded: `&self` for reads, `&mut self`
//! for mutation, no internal locking, no I/O. The page/cursor layer
//! above owns whatever latch protects a node.
//!
//! ## Example
//!
//! ```rust
//! use dmt_rs::BasementNode;
//!
//! let mut bn = BasementNode::new();
//! let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
//!
//! // The caller keeps the node sorted and supplies the index.
//! bn.get_space_for_insert(0, b"alfa", 3).unwrap().copy_from_slice(b"one");
//! bn.get_space_for_insert(1, b"bravo", 3).unwrap().copy_from_slice(b"two");
//!
//! let (idx, key, payload) = bn.find_zero(cmp, b"bravo").unwrap();
//! assert_eq!((idx, key, payload), (1, &b"bravo"[..], &b"two"[..]));
//! ```

pub mod bn;
pub mod dmt;
pub mod error;
pub mod mempool;

pub use bn::{BasementNode, BASEMENT_FORMAT_VERSION};
pub use dmt::{Direction, Dmt, DmtBuilder};
pub use error::{Error, Result};
pub use mempool::Mempool;

#[cfg(test)]
mod proptests;

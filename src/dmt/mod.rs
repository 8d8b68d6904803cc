//! Dual-mode order-maintenance container.
//!
//! A `Dmt` is an ordered sequence of opaque, length-tagged byte values
//! addressed by dense index. It has two mutually exclusive representations
//! over one [`Mempool`]:
//!
//! - **Array**: a packed run of same-length values, arena order = index
//!   order. This is the representation as long as every insertion is a
//!   same-length append at the tail.
//! - **Tree**: a weight-balanced binary tree whose nodes live at arena
//!   offsets (never raw addresses). Any out-of-order insertion, any
//!   length mismatch, or any deletion converts to this form; there is no
//!   automatic reversion ([`Dmt::prepare_for_serialize`] converts back
//!   when the values are uniform).
//!
//! Searches go through a caller-supplied heaviside function: a closure
//! whose [`Ordering`] result is monotonically non-decreasing over the
//! stored order (`Less` = the stored value sorts before the target). The
//! container itself never interprets value bytes.

use std::cmp::Ordering;
use std::ops::ControlFlow;

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Error, Result};
use crate::mempool::{align4, Mempool};

// =============================================================================
// Node layout
// =============================================================================

// Tree nodes are little-endian records inside the arena:
//
// +------------------+ 0
// | weight: u32      | 4
// | left: u32        | 8   (NULL = u32::MAX)
// | right: u32       | 12
// | value_len: u32   | 16  (NODE_HEADER)
// | value bytes      |     (padded to 4-byte alignment)
// +------------------+
//
// weight(n) == 1 + weight(left) + weight(right) for every live node.

const OFF_WEIGHT: u32 = 0;
const OFF_LEFT: u32 = 4;
const OFF_RIGHT: u32 = 8;
const OFF_LEN: u32 = 12;
const OFF_VALUE: u32 = 16;
const NODE_HEADER: usize = 16;

/// Minimum value capacity reserved when an array-form arena first grows.
const MIN_ARRAY_VALUES: usize = 4;

/// Arena offset of a tree node, with a null sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct NodeRef(u32);

impl NodeRef {
    const NULL: NodeRef = NodeRef(u32::MAX);

    #[inline]
    fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
}

/// A link that holds a subtree: the root field or one side of a node.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Root,
    Left(NodeRef),
    Right(NodeRef),
}

/// In-order node lists used by the rebuild paths. Most rebalanced
/// subtrees are small, so the list usually stays on the stack.
type NodeList = SmallVec<[NodeRef; 64]>;

#[inline]
fn node_size(value_len: usize) -> usize {
    NODE_HEADER + align4(value_len)
}

fn write_node(mp: &mut Mempool, offset: u32, value: &[u8]) {
    mp.write_u32(offset + OFF_WEIGHT, 1);
    mp.write_u32(offset + OFF_LEFT, NodeRef::NULL.0);
    mp.write_u32(offset + OFF_RIGHT, NodeRef::NULL.0);
    mp.write_u32(offset + OFF_LEN, value.len() as u32);
    mp.slice_mut(offset + OFF_VALUE, value.len())
        .copy_from_slice(value);
}

/// Link a sorted run of existing nodes into a perfectly weight-balanced
/// subtree and return its root. Only weights and links are rewritten;
/// value bytes never move.
///
/// Shared by local rebalancing, array→tree conversion, and builder
/// finalization.
fn rebuild_subtree(mp: &mut Mempool, sorted: &[NodeRef]) -> NodeRef {
    if sorted.is_empty() {
        return NodeRef::NULL;
    }
    let mid = sorted.len() / 2;
    let root = sorted[mid];
    let left = rebuild_subtree(mp, &sorted[..mid]);
    let right = rebuild_subtree(mp, &sorted[mid + 1..]);
    mp.write_u32(root.0 + OFF_WEIGHT, sorted.len() as u32);
    mp.write_u32(root.0 + OFF_LEFT, left.0);
    mp.write_u32(root.0 + OFF_RIGHT, right.0);
    root
}

/// True when, after applying the hypothetical deltas, either child would
/// hold less than roughly half its sibling's weight.
fn will_need_rebalance(
    left_weight: u32,
    right_weight: u32,
    left_delta: i64,
    right_delta: i64,
) -> bool {
    let l = left_weight as i64 + left_delta;
    let r = right_weight as i64 + right_delta;
    1 + l < (2 + r) / 2 || 1 + r < (2 + l) / 2
}

// =============================================================================
// Representation
// =============================================================================

#[derive(Clone, Copy, Debug)]
enum Repr {
    Array { num_values: u32 },
    Tree { root: NodeRef },
}

/// Which side of the heaviside step a directional search targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Find the smallest index whose value evaluates `Greater`.
    Greater,
    /// Find the largest index whose value evaluates `Less`.
    Less,
}

/// The dual-mode ordered container.
#[derive(Clone, Debug)]
pub struct Dmt {
    mp: Mempool,
    repr: Repr,
    values_same_size: bool,
    value_len: u32,
}

impl Dmt {
    /// Create an empty container (array representation, no storage).
    pub fn new() -> Self {
        Self {
            mp: Mempool::new(0),
            repr: Repr::Array { num_values: 0 },
            values_same_size: true,
            value_len: 0,
        }
    }

    /// Logical element count.
    pub fn size(&self) -> u32 {
        match self.repr {
            Repr::Array { num_values } => num_values,
            Repr::Tree { root } => self.subtree_weight(root),
        }
    }

    /// Whether the packed-array representation is active.
    pub fn is_array(&self) -> bool {
        matches!(self.repr, Repr::Array { .. })
    }

    /// Whether every stored value has the same length.
    pub fn values_same_size(&self) -> bool {
        self.values_same_size
    }

    /// The shared value length, when one exists. Zero while empty.
    pub fn fixed_value_length(&self) -> Option<u32> {
        self.values_same_size.then_some(self.value_len)
    }

    /// Bytes handed out by the backing arena.
    pub fn memory_used(&self) -> usize {
        self.mp.used()
    }

    /// Back to an empty array representation; arena capacity retained.
    pub fn clear(&mut self) {
        self.mp.reset();
        self.repr = Repr::Array { num_values: 0 };
        self.values_same_size = true;
        self.value_len = 0;
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Insert `value` so that it occupies index `idx` (`0 <= idx <= size`).
    ///
    /// Same-length tail appends keep the array representation and cost
    /// amortized O(1); anything else converts to the tree and costs
    /// amortized O(log n). On error the container is unchanged.
    pub fn insert_at(&mut self, value: &[u8], idx: u32) -> Result<()> {
        let size = self.size();
        if idx > size {
            return Err(Error::InvalidIndex { index: idx, size });
        }
        if size == 0 {
            self.value_len = value.len() as u32;
            self.values_same_size = true;
            debug_assert!(self.is_array());
            return self.array_append(value);
        }
        let same_len = self.values_same_size && value.len() as u32 == self.value_len;
        match self.repr {
            Repr::Array { num_values } if idx == num_values && same_len => {
                self.array_append(value)
            }
            _ => {
                self.convert_to_tree()?;
                self.tree_insert(value, idx)
            }
        }
    }

    /// Remove the value at `idx` (`idx < size`).
    ///
    /// Removing the last element clears the container back to an empty
    /// array; every other deletion goes through the tree representation.
    pub fn delete_at(&mut self, idx: u32) -> Result<()> {
        let size = self.size();
        if idx >= size {
            return Err(Error::InvalidIndex { index: idx, size });
        }
        if size == 1 {
            self.clear();
            return Ok(());
        }
        self.convert_to_tree()?;
        self.tree_delete(idx);
        Ok(())
    }

    fn array_append(&mut self, value: &[u8]) -> Result<()> {
        let stride = align4(value.len());
        if self.mp.free_space() < stride {
            let needed = self.mp.used() + stride;
            if needed > u32::MAX as usize {
                return Err(Error::OutOfMemory {
                    requested: stride,
                    available: self.mp.free_space(),
                });
            }
            let new_capacity = needed
                .max(self.mp.capacity() * 2)
                .max(MIN_ARRAY_VALUES * stride)
                .min(u32::MAX as usize);
            self.mp.grow(new_capacity);
        }
        let offset = self.mp.alloc(value.len()).ok_or(Error::OutOfMemory {
            requested: stride,
            available: self.mp.free_space(),
        })?;
        self.mp
            .slice_mut(offset, value.len())
            .copy_from_slice(value);
        match &mut self.repr {
            Repr::Array { num_values } => *num_values += 1,
            Repr::Tree { .. } => unreachable!("array append on tree representation"),
        }
        Ok(())
    }

    /// One-time array→tree conversion: each packed value becomes a node
    /// in a fresh arena, then one rebuild pass links them.
    fn convert_to_tree(&mut self) -> Result<()> {
        let Repr::Array { num_values } = self.repr else {
            return Ok(());
        };
        trace!(num_values, "converting array representation to tree");
        let value_len = self.value_len as usize;
        let stride = align4(value_len);
        let per_node = node_size(value_len);
        let needed = per_node * num_values as usize;
        if needed > u32::MAX as usize {
            return Err(Error::OutOfMemory {
                requested: needed,
                available: 0,
            });
        }
        let mut mp = Mempool::new((needed * 2).max(per_node).min(u32::MAX as usize));
        let mut offsets = NodeList::new();
        offsets.reserve(num_values as usize);
        for i in 0..num_values {
            let offset = mp.alloc(per_node).ok_or(Error::OutOfMemory {
                requested: per_node,
                available: mp.free_space(),
            })?;
            let value = self.mp.slice((i as usize * stride) as u32, value_len);
            write_node(&mut mp, offset, value);
            offsets.push(NodeRef(offset));
        }
        let root = rebuild_subtree(&mut mp, &offsets);
        self.mp = mp;
        self.repr = Repr::Tree { root };
        Ok(())
    }

    fn alloc_node(&mut self, value: &[u8]) -> Result<NodeRef> {
        let size = node_size(value.len());
        if self.mp.free_space() < size {
            let needed = self.mp.used() + size;
            if needed > u32::MAX as usize {
                return Err(Error::OutOfMemory {
                    requested: size,
                    available: self.mp.free_space(),
                });
            }
            let new_capacity = needed.max(self.mp.capacity() * 2).min(u32::MAX as usize);
            self.mp.grow(new_capacity);
        }
        let offset = self.mp.alloc(size).ok_or(Error::OutOfMemory {
            requested: size,
            available: self.mp.free_space(),
        })?;
        write_node(&mut self.mp, offset, value);
        Ok(NodeRef(offset))
    }

    fn tree_insert(&mut self, value: &[u8], mut idx: u32) -> Result<()> {
        if value.len() as u32 != self.value_len {
            self.values_same_size = false;
        }
        // The allocation is the only fallible step; it happens before any
        // weight or link is touched. Arena growth keeps offsets valid.
        let node = self.alloc_node(value)?;

        let Repr::Tree { root } = self.repr else {
            unreachable!("tree insert on array representation")
        };
        let mut slot = Slot::Root;
        let mut cur = root;
        let mut rebalance: Option<Slot> = None;
        while !cur.is_null() {
            let lchild = self.left(cur);
            let rchild = self.right(cur);
            let lw = self.subtree_weight(lchild);
            let rw = self.subtree_weight(rchild);
            let go_left = idx <= lw;
            // Only the highest imbalanced ancestor is rebuilt.
            if rebalance.is_none() {
                let (ld, rd) = if go_left { (1, 0) } else { (0, 1) };
                if will_need_rebalance(lw, rw, ld, rd) {
                    rebalance = Some(slot);
                }
            }
            self.set_weight(cur, lw + rw + 2);
            if go_left {
                slot = Slot::Left(cur);
                cur = lchild;
            } else {
                idx -= lw + 1;
                slot = Slot::Right(cur);
                cur = rchild;
            }
        }
        self.write_slot(slot, node);
        if let Some(rslot) = rebalance {
            self.rebalance_slot(rslot);
        }
        Ok(())
    }

    fn tree_delete(&mut self, mut idx: u32) {
        let Repr::Tree { root } = self.repr else {
            unreachable!("tree delete on array representation")
        };
        let mut slot = Slot::Root;
        let mut cur = root;
        let mut rebalance: Option<Slot> = None;

        // Descend to the target, decrementing weights on the way.
        loop {
            let lchild = self.left(cur);
            let lw = self.subtree_weight(lchild);
            if idx == lw {
                break;
            }
            let go_left = idx < lw;
            if rebalance.is_none() {
                let rw = self.subtree_weight(self.right(cur));
                let (ld, rd) = if go_left { (-1, 0) } else { (0, -1) };
                if will_need_rebalance(lw, rw, ld, rd) {
                    rebalance = Some(slot);
                }
            }
            self.set_weight(cur, self.weight(cur) - 1);
            if go_left {
                slot = Slot::Left(cur);
                cur = lchild;
            } else {
                idx -= lw + 1;
                slot = Slot::Right(cur);
                cur = self.right(cur);
            }
        }

        let target = cur;
        let target_len = self.node_len(target) as usize;
        let lchild = self.left(target);
        let rchild = self.right(target);

        if lchild.is_null() || rchild.is_null() {
            // Zero or one child: splice the sole child upward.
            let child = if lchild.is_null() { rchild } else { lchild };
            self.write_slot(slot, child);
        } else {
            // Two children: swap linkage with the in-order successor, the
            // leftmost node of the right subtree. Value bytes never move.
            if rebalance.is_none()
                && will_need_rebalance(self.weight(lchild), self.weight(rchild), 0, -1)
            {
                rebalance = Some(slot);
            }
            let new_weight = self.weight(target) - 1;

            let mut succ_slot = Slot::Right(target);
            let mut succ = rchild;
            while !self.left(succ).is_null() {
                if rebalance.is_none() {
                    let lw = self.subtree_weight(self.left(succ));
                    let rw = self.subtree_weight(self.right(succ));
                    if will_need_rebalance(lw, rw, -1, 0) {
                        rebalance = Some(succ_slot);
                    }
                }
                self.set_weight(succ, self.weight(succ) - 1);
                succ_slot = Slot::Left(succ);
                succ = self.left(succ);
            }

            match succ_slot {
                Slot::Right(p) if p == target => {
                    // Successor is the target's direct right child; it
                    // keeps its own right subtree.
                    self.set_left(succ, lchild);
                }
                Slot::Left(parent) => {
                    self.set_left(parent, self.right(succ));
                    self.set_left(succ, lchild);
                    self.set_right(succ, rchild);
                }
                _ => unreachable!("successor slot cannot be the root"),
            }
            self.set_weight(succ, new_weight);
            self.write_slot(slot, succ);

            // A candidate recorded against the deleted node now hangs off
            // its replacement.
            if let Some(Slot::Right(p)) = rebalance {
                if p == target {
                    rebalance = Some(Slot::Right(succ));
                }
            }
        }

        self.mp.free(target.0, node_size(target_len));
        if let Some(rslot) = rebalance {
            self.rebalance_slot(rslot);
        }
    }

    fn rebalance_slot(&mut self, slot: Slot) {
        let sub = self.read_slot(slot);
        debug_assert!(!sub.is_null());
        let mut offsets = NodeList::new();
        offsets.reserve(self.weight(sub) as usize);
        self.fill_in_order(sub, &mut offsets);
        let new_root = rebuild_subtree(&mut self.mp, &offsets);
        self.write_slot(slot, new_root);
    }

    fn fill_in_order(&self, n: NodeRef, out: &mut NodeList) {
        if n.is_null() {
            return;
        }
        self.fill_in_order(self.left(n), out);
        out.push(n);
        self.fill_in_order(self.right(n), out);
    }

    // -------------------------------------------------------------------------
    // Fetch by index
    // -------------------------------------------------------------------------

    /// Value at index `idx`.
    pub fn fetch(&self, idx: u32) -> Result<&[u8]> {
        let size = self.size();
        if idx >= size {
            return Err(Error::InvalidIndex { index: idx, size });
        }
        match self.repr {
            Repr::Array { .. } => Ok(self.array_value(idx)),
            Repr::Tree { root } => {
                let n = self.node_at_rank(root, idx);
                Ok(self.node_value(n))
            }
        }
    }

    /// Mutable access to the value bytes at index `idx`. The length of a
    /// stored value can never change through this path.
    pub fn value_mut(&mut self, idx: u32) -> Result<&mut [u8]> {
        let size = self.size();
        if idx >= size {
            return Err(Error::InvalidIndex { index: idx, size });
        }
        match self.repr {
            Repr::Array { .. } => {
                let stride = align4(self.value_len as usize);
                let len = self.value_len as usize;
                Ok(self.mp.slice_mut((idx as usize * stride) as u32, len))
            }
            Repr::Tree { root } => {
                let n = self.node_at_rank(root, idx);
                let len = self.node_len(n) as usize;
                Ok(self.mp.slice_mut(n.0 + OFF_VALUE, len))
            }
        }
    }

    fn node_at_rank(&self, root: NodeRef, mut idx: u32) -> NodeRef {
        let mut cur = root;
        loop {
            debug_assert!(!cur.is_null());
            let lchild = self.left(cur);
            let lw = self.subtree_weight(lchild);
            match idx.cmp(&lw) {
                Ordering::Less => cur = lchild,
                Ordering::Equal => return cur,
                Ordering::Greater => {
                    idx -= lw + 1;
                    cur = self.right(cur);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Heaviside search
    // -------------------------------------------------------------------------

    /// Find the unique index where `h` evaluates `Equal`.
    ///
    /// On a miss, the returned [`Error::NotFound`] carries the index at
    /// which a matching value would have to be inserted.
    pub fn find_zero<F>(&self, h: F) -> Result<(u32, &[u8])>
    where
        F: Fn(&[u8]) -> Ordering,
    {
        match self.repr {
            Repr::Array { num_values } => {
                // Lower bound of h != Less.
                let mut lo = 0u32;
                let mut hi = num_values;
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if h(self.array_value(mid)) == Ordering::Less {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                if lo < num_values && h(self.array_value(lo)) == Ordering::Equal {
                    Ok((lo, self.array_value(lo)))
                } else {
                    Err(Error::NotFound { insert_index: lo })
                }
            }
            Repr::Tree { root } => {
                let mut cur = root;
                let mut rank = 0u32;
                while !cur.is_null() {
                    let lw = self.subtree_weight(self.left(cur));
                    match h(self.node_value(cur)) {
                        Ordering::Less => {
                            rank += lw + 1;
                            cur = self.right(cur);
                        }
                        Ordering::Equal => return Ok((rank + lw, self.node_value(cur))),
                        Ordering::Greater => cur = self.left(cur),
                    }
                }
                Err(Error::NotFound { insert_index: rank })
            }
        }
    }

    /// Directional search: the smallest index evaluating `Greater`, or
    /// the largest index evaluating `Less`.
    pub fn find<F>(&self, h: F, direction: Direction) -> Result<(u32, &[u8])>
    where
        F: Fn(&[u8]) -> Ordering,
    {
        match self.repr {
            Repr::Array { num_values } => {
                let mut lo = 0u32;
                let mut hi = num_values;
                match direction {
                    Direction::Greater => {
                        while lo < hi {
                            let mid = lo + (hi - lo) / 2;
                            if h(self.array_value(mid)) == Ordering::Greater {
                                hi = mid;
                            } else {
                                lo = mid + 1;
                            }
                        }
                        if lo < num_values {
                            Ok((lo, self.array_value(lo)))
                        } else {
                            Err(Error::NotFound { insert_index: lo })
                        }
                    }
                    Direction::Less => {
                        while lo < hi {
                            let mid = lo + (hi - lo) / 2;
                            if h(self.array_value(mid)) == Ordering::Less {
                                lo = mid + 1;
                            } else {
                                hi = mid;
                            }
                        }
                        if lo > 0 {
                            Ok((lo - 1, self.array_value(lo - 1)))
                        } else {
                            Err(Error::NotFound { insert_index: 0 })
                        }
                    }
                }
            }
            Repr::Tree { root } => {
                let mut cur = root;
                let mut rank = 0u32;
                let mut best: Option<(u32, NodeRef)> = None;
                match direction {
                    Direction::Greater => {
                        while !cur.is_null() {
                            let lw = self.subtree_weight(self.left(cur));
                            if h(self.node_value(cur)) == Ordering::Greater {
                                best = Some((rank + lw, cur));
                                cur = self.left(cur);
                            } else {
                                rank += lw + 1;
                                cur = self.right(cur);
                            }
                        }
                        match best {
                            Some((idx, n)) => Ok((idx, self.node_value(n))),
                            None => Err(Error::NotFound { insert_index: rank }),
                        }
                    }
                    Direction::Less => {
                        while !cur.is_null() {
                            let lw = self.subtree_weight(self.left(cur));
                            if h(self.node_value(cur)) == Ordering::Less {
                                best = Some((rank + lw, cur));
                                rank += lw + 1;
                                cur = self.right(cur);
                            } else {
                                cur = self.left(cur);
                            }
                        }
                        match best {
                            Some((idx, n)) => Ok((idx, self.node_value(n))),
                            None => Err(Error::NotFound { insert_index: 0 }),
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Iteration
    // -------------------------------------------------------------------------

    /// In-order visit of indices in `[left, right)`.
    ///
    /// Tree-mode recursion recomputes each node's rank from subtree
    /// weights, so a traversal carries no state between calls. No
    /// traversal may run concurrently with mutation of the same instance
    /// (enforced by the borrow rules).
    pub fn iterate_on_range<F>(&self, left: u32, right: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> ControlFlow<()>,
    {
        let size = self.size();
        if right > size {
            return Err(Error::InvalidIndex { index: right, size });
        }
        match self.repr {
            Repr::Array { .. } => {
                for i in left..right {
                    if f(i, self.array_value(i)).is_break() {
                        break;
                    }
                }
            }
            Repr::Tree { root } => {
                let _ = self.iterate_node(root, 0, left, right, &mut f);
            }
        }
        Ok(())
    }

    /// Mutable variant of [`Dmt::iterate_on_range`].
    pub fn iterate_mut_on_range<F>(&mut self, left: u32, right: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &mut [u8]) -> ControlFlow<()>,
    {
        let size = self.size();
        if right > size {
            return Err(Error::InvalidIndex { index: right, size });
        }
        match self.repr {
            Repr::Array { .. } => {
                let stride = align4(self.value_len as usize);
                let len = self.value_len as usize;
                for i in left..right {
                    let offset = (i as usize * stride) as u32;
                    if f(i, self.mp.slice_mut(offset, len)).is_break() {
                        break;
                    }
                }
            }
            Repr::Tree { root } => {
                let _ = self.iterate_node_mut(root, 0, left, right, &mut f);
            }
        }
        Ok(())
    }

    fn iterate_node<F>(
        &self,
        n: NodeRef,
        base: u32,
        left: u32,
        right: u32,
        f: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(u32, &[u8]) -> ControlFlow<()>,
    {
        if n.is_null() {
            return ControlFlow::Continue(());
        }
        let lw = self.subtree_weight(self.left(n));
        let rank = base + lw;
        if left < rank {
            self.iterate_node(self.left(n), base, left, right, f)?;
        }
        if left <= rank && rank < right {
            f(rank, self.node_value(n))?;
        }
        if rank + 1 < right {
            self.iterate_node(self.right(n), rank + 1, left, right, f)?;
        }
        ControlFlow::Continue(())
    }

    fn iterate_node_mut<F>(
        &mut self,
        n: NodeRef,
        base: u32,
        left: u32,
        right: u32,
        f: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(u32, &mut [u8]) -> ControlFlow<()>,
    {
        if n.is_null() {
            return ControlFlow::Continue(());
        }
        let lchild = self.left(n);
        let rchild = self.right(n);
        let lw = self.subtree_weight(lchild);
        let rank = base + lw;
        if left < rank {
            self.iterate_node_mut(lchild, base, left, right, f)?;
        }
        if left <= rank && rank < right {
            let len = self.node_len(n) as usize;
            f(rank, self.mp.slice_mut(n.0 + OFF_VALUE, len))?;
        }
        if rank + 1 < right {
            self.iterate_node_mut(rchild, rank + 1, left, right, f)?;
        }
        ControlFlow::Continue(())
    }

    // -------------------------------------------------------------------------
    // Serialization support
    // -------------------------------------------------------------------------

    /// Convert the tree representation back to a packed array, which is
    /// only legal when every value has the same length. A no-op for
    /// variable-length contents and for containers already in array form.
    pub fn prepare_for_serialize(&mut self) {
        if !self.values_same_size {
            return;
        }
        let Repr::Tree { root } = self.repr else {
            return;
        };
        let num_values = self.subtree_weight(root);
        trace!(num_values, "converting tree representation to array");
        let value_len = self.value_len as usize;
        let mut offsets = NodeList::new();
        offsets.reserve(num_values as usize);
        self.fill_in_order(root, &mut offsets);

        let mut mp = Mempool::new(num_values as usize * align4(value_len));
        for n in &offsets {
            let offset = mp
                .alloc(value_len)
                .expect("array arena sized for exactly num_values values");
            let value = self.node_value(*n);
            mp.slice_mut(offset, value_len).copy_from_slice(value);
        }
        self.mp = mp;
        self.repr = Repr::Array { num_values };
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check structural invariants. Idempotent and side-effect-free;
    /// panics on violation.
    pub fn verify(&self) {
        match self.repr {
            Repr::Array { num_values } => {
                assert!(
                    self.values_same_size,
                    "array representation requires fixed-size values"
                );
                let stride = align4(self.value_len as usize);
                assert_eq!(
                    self.mp.used(),
                    num_values as usize * stride,
                    "array arena accounting mismatch"
                );
            }
            Repr::Tree { root } => {
                assert!(!root.is_null(), "tree representation cannot be empty");
                self.verify_node(root);
            }
        }
    }

    fn verify_node(&self, n: NodeRef) -> u32 {
        if n.is_null() {
            return 0;
        }
        let lw = self.verify_node(self.left(n));
        let rw = self.verify_node(self.right(n));
        assert_eq!(self.weight(n), lw + rw + 1, "weight invariant violated");
        let len = self.node_len(n) as usize;
        assert!(
            n.0 as usize + node_size(len) <= self.mp.used(),
            "node outside the allocated arena region"
        );
        if self.values_same_size {
            assert_eq!(self.node_len(n), self.value_len, "fixed-size flag is stale");
        }
        lw + rw + 1
    }

    // -------------------------------------------------------------------------
    // Node accessors
    // -------------------------------------------------------------------------

    #[inline]
    fn array_value(&self, i: u32) -> &[u8] {
        let stride = align4(self.value_len as usize);
        self.mp
            .slice((i as usize * stride) as u32, self.value_len as usize)
    }

    #[inline]
    fn weight(&self, n: NodeRef) -> u32 {
        self.mp.read_u32(n.0 + OFF_WEIGHT)
    }

    #[inline]
    fn subtree_weight(&self, n: NodeRef) -> u32 {
        if n.is_null() {
            0
        } else {
            self.weight(n)
        }
    }

    #[inline]
    fn left(&self, n: NodeRef) -> NodeRef {
        NodeRef(self.mp.read_u32(n.0 + OFF_LEFT))
    }

    #[inline]
    fn right(&self, n: NodeRef) -> NodeRef {
        NodeRef(self.mp.read_u32(n.0 + OFF_RIGHT))
    }

    #[inline]
    fn node_len(&self, n: NodeRef) -> u32 {
        self.mp.read_u32(n.0 + OFF_LEN)
    }

    #[inline]
    fn node_value(&self, n: NodeRef) -> &[u8] {
        let len = self.node_len(n) as usize;
        self.mp.slice(n.0 + OFF_VALUE, len)
    }

    #[inline]
    fn set_weight(&mut self, n: NodeRef, weight: u32) {
        self.mp.write_u32(n.0 + OFF_WEIGHT, weight);
    }

    #[inline]
    fn set_left(&mut self, n: NodeRef, child: NodeRef) {
        self.mp.write_u32(n.0 + OFF_LEFT, child.0);
    }

    #[inline]
    fn set_right(&mut self, n: NodeRef, child: NodeRef) {
        self.mp.write_u32(n.0 + OFF_RIGHT, child.0);
    }

    fn read_slot(&self, slot: Slot) -> NodeRef {
        match slot {
            Slot::Root => match self.repr {
                Repr::Tree { root } => root,
                Repr::Array { .. } => unreachable!("slot access in array representation"),
            },
            Slot::Left(p) => self.left(p),
            Slot::Right(p) => self.right(p),
        }
    }

    fn write_slot(&mut self, slot: Slot, child: NodeRef) {
        match slot {
            Slot::Root => self.repr = Repr::Tree { root: child },
            Slot::Left(p) => self.set_left(p, child),
            Slot::Right(p) => self.set_right(p, child),
        }
    }
}

impl Default for Dmt {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Append-only fast path for constructing a [`Dmt`] from a pre-sorted
/// stream, with no incremental rebalancing.
///
/// Values must be appended in final index order. While every value has
/// the same length the builder stays in packed-array form; the first
/// length mismatch migrates to flat node accumulation, and
/// [`DmtBuilder::build`] runs the rebuild primitive exactly once.
pub struct DmtBuilder {
    mp: Mempool,
    form: BuilderForm,
    num_values: u32,
    max_values: u32,
    value_len: u32,
}

enum BuilderForm {
    Array,
    Nodes { offsets: Vec<NodeRef> },
}

impl DmtBuilder {
    /// Pre-size one arena for at most `max_values` values totalling at
    /// most `max_value_bytes` bytes, with node-header and alignment
    /// slack so a mid-build migration to node form never reallocates.
    pub fn new(max_values: u32, max_value_bytes: usize) -> Self {
        let capacity = max_value_bytes + max_values as usize * (NODE_HEADER + crate::mempool::ALLOC_ALIGN);
        Self {
            mp: Mempool::new(capacity.min(u32::MAX as usize)),
            form: BuilderForm::Array,
            num_values: 0,
            max_values,
            value_len: 0,
        }
    }

    /// Number of values appended so far.
    pub fn num_values(&self) -> u32 {
        self.num_values
    }

    /// Append the next value in sorted order.
    pub fn append(&mut self, value: &[u8]) -> Result<()> {
        assert!(
            self.num_values < self.max_values,
            "builder appended past its declared capacity"
        );
        if self.num_values == 0 {
            self.value_len = value.len() as u32;
        }
        let matches_len = value.len() as u32 == self.value_len;
        if matches!(self.form, BuilderForm::Array) && !matches_len {
            self.switch_to_nodes()?;
        }
        if matches!(self.form, BuilderForm::Array) {
            let offset = self.mp.alloc(value.len()).ok_or(Error::OutOfMemory {
                requested: value.len(),
                available: self.mp.free_space(),
            })?;
            self.mp
                .slice_mut(offset, value.len())
                .copy_from_slice(value);
        } else {
            let size = node_size(value.len());
            let offset = self.mp.alloc(size).ok_or(Error::OutOfMemory {
                requested: size,
                available: self.mp.free_space(),
            })?;
            write_node(&mut self.mp, offset, value);
            let BuilderForm::Nodes { offsets } = &mut self.form else {
                unreachable!()
            };
            offsets.push(NodeRef(offset));
        }
        self.num_values += 1;
        Ok(())
    }

    /// Migrate the packed prefix into node form in a fresh arena. The
    /// pre-sized capacity already accounts for node headers, so this is
    /// a single O(appended-so-far) pass.
    fn switch_to_nodes(&mut self) -> Result<()> {
        trace!(
            num_values = self.num_values,
            "builder switching to variable-length node form"
        );
        let value_len = self.value_len as usize;
        let stride = align4(value_len);
        let mut mp = Mempool::new(self.mp.capacity());
        let mut offsets = Vec::with_capacity(self.max_values as usize);
        for i in 0..self.num_values {
            let size = node_size(value_len);
            let offset = mp.alloc(size).ok_or(Error::OutOfMemory {
                requested: size,
                available: mp.free_space(),
            })?;
            let value = self.mp.slice((i as usize * stride) as u32, value_len);
            write_node(&mut mp, offset, value);
            offsets.push(NodeRef(offset));
        }
        self.mp = mp;
        self.form = BuilderForm::Nodes { offsets };
        Ok(())
    }

    /// Finalize into a [`Dmt`].
    ///
    /// Node form gets one balanced rebuild over the whole offset list.
    /// If more than a quarter of the arena would remain slack, the used
    /// prefix is copied down into a tightly-sized arena.
    pub fn build(mut self) -> Dmt {
        let (repr, values_same_size) = match self.form {
            BuilderForm::Array => (
                Repr::Array {
                    num_values: self.num_values,
                },
                true,
            ),
            BuilderForm::Nodes { offsets } => {
                let root = rebuild_subtree(&mut self.mp, &offsets);
                (Repr::Tree { root }, false)
            }
        };
        if self.mp.free_space() * 4 > self.mp.capacity() {
            trace!(
                used = self.mp.used(),
                capacity = self.mp.capacity(),
                "shrinking builder arena"
            );
            self.mp.shrink_to_used();
        }
        Dmt {
            mp: self.mp,
            repr,
            values_same_size,
            value_len: self.value_len,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

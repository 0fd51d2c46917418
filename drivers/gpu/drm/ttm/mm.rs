// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Range allocator
//!
//! Hands out non-overlapping `[start, start + size)` blocks of a linear integer range. Blocks are
//! identified by `NodeId` and carry a typed payload `T`; the allocator-wide user state `A` lives
//! behind the same lock as the free list, so callers can keep auxiliary structures (such as an
//! LRU over the allocated nodes) consistent with allocation state.
//!
//! The locked [`MmGuard`] exposes the split search/allocate/free primitives needed by eviction
//! loops, which search, evict, and search again without dropping the lock except around explicit
//! waits (see `parking_lot::MutexGuard::unlocked`).

use crate::debug::*;
use crate::error::{Result, TtmError};

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Mm;

/// Identifier of an allocated node. Never reused within one allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

/// Trait which must be implemented by the inner allocator state type provided by the user.
pub trait AllocInner<T> {
    /// Notification that a node was dropped from the allocator.
    fn drop_object(&mut self, _id: NodeId, _start: u64, _size: u64, _object: &mut T) {}
}

impl<T> AllocInner<T> for () {}

/// Available node insertion modes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertMode {
    /// Search for the smallest hole that fits the desired node.
    ///
    /// Allocates the node from the bottom of the found hole.
    Best,

    /// Search for the lowest hole (address closest to 0) that fits the desired node.
    ///
    /// Allocates the node from the bottom of the found hole.
    Low,

    /// Search for the highest hole that fits the desired node.
    ///
    /// Allocates the node from the top of the found hole. The alignment applies to the node
    /// base.
    High,
}

/// Represents a single allocated node.
pub struct NodeData<T> {
    start: u64,
    size: u64,
    color: usize,
    inner: T,
}

impl<T> NodeData<T> {
    /// Returns the color of the node (an opaque value)
    pub fn color(&self) -> usize {
        self.color
    }

    /// Returns the start address of the node
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Returns the size of the node
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the user payload.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Returns the user payload, mutably.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

/// A free block found by [`MmGuard::search_free`], ready to be claimed with
/// [`MmGuard::get_block`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Hole {
    /// Start of the containing free extent.
    hole_start: u64,
    /// Start of the block to carve out of it, alignment applied.
    start: u64,
    size: u64,
}

impl Hole {
    /// Returns the start address the node would get.
    pub fn start(&self) -> u64 {
        self.start
    }
}

/// Allocator state, protected by the allocator lock.
pub struct MmInner<A: AllocInner<T>, T> {
    start: u64,
    size: u64,
    /// Free extents: start -> size. Adjacent extents are always merged.
    holes: BTreeMap<u64, u64>,
    nodes: BTreeMap<NodeId, NodeData<T>>,
    next_id: u64,
    user: A,
}

/// The locked allocator.
pub type MmGuard<'a, A, T> = MutexGuard<'a, MmInner<A, T>>;

fn align_up(val: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(val);
    }
    let rem = val % alignment;
    if rem == 0 {
        Some(val)
    } else {
        val.checked_add(alignment - rem)
    }
}

fn align_down(val: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        val
    } else {
        val - val % alignment
    }
}

impl<A: AllocInner<T>, T> MmInner<A, T> {
    /// Returns the first address managed by this allocator.
    pub fn range_start(&self) -> u64 {
        self.start
    }

    /// Returns the size of the managed range.
    pub fn range_size(&self) -> u64 {
        self.size
    }

    /// Returns the total free space.
    pub fn free_space(&self) -> u64 {
        self.holes.values().sum()
    }

    /// Returns the size of the largest free extent.
    pub fn largest_hole(&self) -> u64 {
        self.holes.values().copied().max().unwrap_or(0)
    }

    /// Returns the number of allocated nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the user state.
    pub fn user(&self) -> &A {
        &self.user
    }

    /// Returns the user state, mutably.
    pub fn user_mut(&mut self) -> &mut A {
        &mut self.user
    }

    /// Returns both the user state and the node table, for callers that update one while
    /// reading the other.
    pub fn split_mut(&mut self) -> (&mut A, &mut BTreeMap<NodeId, NodeData<T>>) {
        (&mut self.user, &mut self.nodes)
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> Option<&NodeData<T>> {
        self.nodes.get(&id)
    }

    /// Looks up a node, mutably.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeData<T>> {
        self.nodes.get_mut(&id)
    }

    /// Finds a free block of `size` within `[range_start, range_end)`.
    pub fn search_free_in_range(
        &self,
        size: u64,
        alignment: u64,
        range_start: u64,
        range_end: u64,
        mode: InsertMode,
    ) -> Option<Hole> {
        if size == 0 {
            return None;
        }

        let mut best: Option<(Hole, u64)> = None;

        for (&hole_start, &hole_size) in self.holes.iter() {
            let lo = hole_start.max(range_start);
            let hi = (hole_start + hole_size).min(range_end);
            if hi <= lo || hi - lo < size {
                continue;
            }

            let start = match mode {
                InsertMode::High => align_down(hi - size, alignment),
                InsertMode::Best | InsertMode::Low => match align_up(lo, alignment) {
                    Some(s) => s,
                    None => continue,
                },
            };
            if start < lo || start.checked_add(size).map_or(true, |end| end > hi) {
                continue;
            }

            let hole = Hole {
                hole_start,
                start,
                size,
            };

            match mode {
                InsertMode::Low => return Some(hole),
                InsertMode::High => best = Some((hole, hole_start)),
                InsertMode::Best => {
                    if best.map_or(true, |(_, best_size)| hole_size < best_size) {
                        best = Some((hole, hole_size));
                    }
                }
            }
        }

        best.map(|(hole, _)| hole)
    }

    /// Finds a free block of `size` anywhere in the range.
    pub fn search_free(&self, size: u64, alignment: u64, mode: InsertMode) -> Option<Hole> {
        self.search_free_in_range(size, alignment, 0, u64::MAX, mode)
    }

    fn next_node_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    /// Carves `[start, start + size)` out of the free extent starting at `hole_start`.
    fn carve(&mut self, hole_start: u64, start: u64, size: u64) -> Result {
        let hole_size = *self
            .holes
            .get(&hole_start)
            .ok_or(TtmError::InvalidArgument("stale hole"))?;
        let hole_end = hole_start + hole_size;
        if start < hole_start || start + size > hole_end {
            return Err(TtmError::InvalidArgument("block outside hole"));
        }

        self.holes.remove(&hole_start);
        if start > hole_start {
            self.holes.insert(hole_start, start - hole_start);
        }
        if start + size < hole_end {
            self.holes.insert(start + size, hole_end - (start + size));
        }
        Ok(())
    }

    /// Claims a block previously returned by `search_free`.
    pub fn get_block(&mut self, hole: Hole, object: T, color: usize) -> Result<NodeId> {
        self.carve(hole.hole_start, hole.start, hole.size)?;

        let id = self.next_node_id();
        self.nodes.insert(
            id,
            NodeData {
                start: hole.start,
                size: hole.size,
                color,
                inner: object,
            },
        );

        mod_pr_debug!(
            "Mm: node {:?} at [{:#x}, {:#x})",
            id,
            hole.start,
            hole.start + hole.size
        );
        Ok(id)
    }

    /// Inserts a node at a fixed address.
    pub fn reserve_node(&mut self, object: T, start: u64, size: u64, color: usize) -> Result<NodeId> {
        let end = start
            .checked_add(size)
            .ok_or(TtmError::InvalidArgument("range overflow"))?;
        if size == 0 {
            return Err(TtmError::InvalidArgument("empty node"));
        }

        let (&hole_start, &hole_size) = self
            .holes
            .range(..=start)
            .next_back()
            .ok_or(TtmError::OutOfApertureSpace)?;
        if hole_start + hole_size < end {
            return Err(TtmError::OutOfApertureSpace);
        }

        self.get_block(
            Hole {
                hole_start,
                start,
                size,
            },
            object,
            color,
        )
    }

    /// Releases a node back to the free list, returning its payload.
    ///
    /// Must be called with the lock held; this is the only way nodes leave the allocator.
    pub fn put_block(&mut self, id: NodeId) -> Option<T> {
        let mut node = self.nodes.remove(&id)?;
        self.user
            .drop_object(id, node.start, node.size, &mut node.inner);

        let mut start = node.start;
        let mut size = node.size;

        if let Some((&prev_start, &prev_size)) = self.holes.range(..start).next_back() {
            if prev_start + prev_size == start {
                self.holes.remove(&prev_start);
                start = prev_start;
                size += prev_size;
            }
        }
        if let Some(next_size) = self.holes.remove(&(node.start + node.size)) {
            size += next_size;
        }
        self.holes.insert(start, size);

        mod_pr_debug!(
            "Mm: released node {:?} at [{:#x}, {:#x})",
            id,
            node.start,
            node.start + node.size
        );
        Some(node.inner)
    }

    /// Returns true if no nodes are allocated.
    pub fn clean(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// An instance of a range allocator.
pub struct Allocator<A: AllocInner<T>, T> {
    mm: Arc<Mutex<MmInner<A, T>>>,
}

impl<A: AllocInner<T>, T> Clone for Allocator<A, T> {
    fn clone(&self) -> Self {
        Allocator {
            mm: self.mm.clone(),
        }
    }
}

impl<A: AllocInner<T>, T> Allocator<A, T> {
    /// Create a new range allocator for the given start and size range of addresses.
    ///
    /// The user provides an inner object representing allocator state, which will be protected
    /// by the same lock. If not required, `()` can be used.
    pub fn new(start: u64, size: u64, inner: A) -> Result<Allocator<A, T>> {
        if size == 0 || start.checked_add(size).is_none() {
            return Err(TtmError::InvalidArgument("allocator range"));
        }

        let mut holes = BTreeMap::new();
        holes.insert(start, size);

        Ok(Allocator {
            mm: Arc::new(Mutex::new(MmInner {
                start,
                size,
                holes,
                nodes: BTreeMap::new(),
                next_id: 0,
                user: inner,
            })),
        })
    }

    /// Takes the allocator lock.
    pub fn lock(&self) -> MmGuard<'_, A, T> {
        self.mm.lock()
    }

    /// Insert a new node into the allocator of a given size.
    ///
    /// `node` is the user `T` type data to store into the node.
    pub fn insert_node(&self, node: T, size: u64) -> Result<NodeId> {
        self.insert_node_generic(node, size, 0, 0, InsertMode::Best)
    }

    /// Insert a new node into the allocator of a given size, with configurable alignment,
    /// color, and insertion mode.
    pub fn insert_node_generic(
        &self,
        node: T,
        size: u64,
        alignment: u64,
        color: usize,
        mode: InsertMode,
    ) -> Result<NodeId> {
        self.insert_node_in_range(node, size, alignment, color, 0, u64::MAX, mode)
    }

    /// Insert a new node into the allocator of a given size, with configurable alignment,
    /// color, insertion mode, and sub-range to allocate from.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_in_range(
        &self,
        node: T,
        size: u64,
        alignment: u64,
        color: usize,
        start: u64,
        end: u64,
        mode: InsertMode,
    ) -> Result<NodeId> {
        let mut guard = self.mm.lock();
        let hole = guard
            .search_free_in_range(size, alignment, start, end, mode)
            .ok_or(TtmError::OutOfApertureSpace)?;
        guard.get_block(hole, node, color)
    }

    /// Insert a node into the allocator at a fixed start address.
    pub fn reserve_node(&self, node: T, start: u64, size: u64, color: usize) -> Result<NodeId> {
        self.mm.lock().reserve_node(node, start, size, color)
    }

    /// Removes a node, returning its payload.
    pub fn remove_node(&self, id: NodeId) -> Option<T> {
        self.mm.lock().put_block(id)
    }

    /// Operate on the inner user type `A`, taking the allocator lock
    pub fn with_inner<RetVal>(&self, cb: impl FnOnce(&mut A) -> RetVal) -> RetVal {
        let mut guard = self.mm.lock();
        cb(&mut guard.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dropped(Vec<NodeId>);

    impl AllocInner<u32> for Dropped {
        fn drop_object(&mut self, id: NodeId, _start: u64, _size: u64, _object: &mut u32) {
            self.0.push(id);
        }
    }

    #[test]
    fn fill_and_coalesce() {
        let mm: Allocator<(), u32> = Allocator::new(100, 30, ()).unwrap();
        let a = mm.insert_node(1, 10).unwrap();
        let b = mm.insert_node(2, 10).unwrap();
        let c = mm.insert_node(3, 10).unwrap();
        assert_eq!(mm.insert_node(4, 1), Err(TtmError::OutOfApertureSpace));

        {
            let guard = mm.lock();
            assert_eq!(guard.node(a).unwrap().start(), 100);
            assert_eq!(guard.node(b).unwrap().start(), 110);
            assert_eq!(guard.node(c).unwrap().start(), 120);
            assert_eq!(guard.free_space(), 0);
        }

        assert_eq!(mm.remove_node(a), Some(1));
        assert_eq!(mm.remove_node(c), Some(3));
        assert_eq!(mm.remove_node(c), None);
        assert_eq!(mm.lock().largest_hole(), 10);
        assert_eq!(mm.insert_node(5, 11), Err(TtmError::OutOfApertureSpace));

        mm.remove_node(b);
        let guard = mm.lock();
        assert_eq!(guard.largest_hole(), 30);
        assert!(guard.clean());
    }

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mm: Allocator<(), u32> = Allocator::new(0, 100, ()).unwrap();
        let a = mm.insert_node(0, 10).unwrap();
        let _b = mm.insert_node(0, 10).unwrap();
        let c = mm.insert_node(0, 5).unwrap();
        let _d = mm.insert_node(0, 10).unwrap();
        mm.remove_node(a);
        mm.remove_node(c);

        // Holes: [0, 10), [20, 25), [35, 100)
        let e = mm.insert_node(0, 5).unwrap();
        assert_eq!(mm.lock().node(e).unwrap().start(), 20);
        let f = mm
            .insert_node_generic(0, 5, 0, 0, InsertMode::Low)
            .unwrap();
        assert_eq!(mm.lock().node(f).unwrap().start(), 0);
        let g = mm
            .insert_node_generic(0, 5, 0, 0, InsertMode::High)
            .unwrap();
        assert_eq!(mm.lock().node(g).unwrap().start(), 95);
    }

    #[test]
    fn alignment_and_range() {
        let mm: Allocator<(), ()> = Allocator::new(1, 63, ()).unwrap();
        let a = mm.insert_node_generic((), 4, 16, 7, InsertMode::Best).unwrap();
        let guard = mm.lock();
        assert_eq!(guard.node(a).unwrap().start(), 16);
        assert_eq!(guard.node(a).unwrap().color(), 7);
        drop(guard);

        let b = mm
            .insert_node_in_range((), 4, 0, 0, 40, 48, InsertMode::Low)
            .unwrap();
        assert_eq!(mm.lock().node(b).unwrap().start(), 40);
        assert!(mm
            .insert_node_in_range((), 8, 0, 0, 40, 48, InsertMode::Low)
            .is_err());
    }

    #[test]
    fn reserve_fixed() {
        let mm: Allocator<(), ()> = Allocator::new(0, 16, ()).unwrap();
        mm.reserve_node((), 4, 4, 0).unwrap();
        assert_eq!(
            mm.reserve_node((), 6, 4, 0),
            Err(TtmError::OutOfApertureSpace)
        );
        mm.reserve_node((), 8, 8, 0).unwrap();
        let guard = mm.lock();
        assert_eq!(guard.free_space(), 4);
    }

    #[test]
    fn split_search_and_drop_notification() {
        let mm: Allocator<Dropped, u32> = Allocator::new(0, 8, Dropped::default()).unwrap();
        let mut guard = mm.lock();
        let hole = guard.search_free(8, 0, InsertMode::Best).unwrap();
        assert_eq!(hole.start(), 0);
        let id = guard.get_block(hole, 42, 0).unwrap();
        assert!(guard.search_free(1, 0, InsertMode::Best).is_none());
        assert_eq!(guard.put_block(id), Some(42));
        assert_eq!(guard.user().0, vec![id]);
    }
}

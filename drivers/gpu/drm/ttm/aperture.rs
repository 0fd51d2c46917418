// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Aperture residency manager
//!
//! Keeps regions resident in the GART aperture. Space comes from a range allocator whose nodes
//! carry per-region fence bookkeeping; every evictable resident node also sits on an LRU list,
//! kept in fence order: fenced entries at the head, oldest fence first, followed by entries that
//! were validated but not fenced yet. When the allocator is full, validation evicts from the head
//! after waiting for the victim's fence, and refuses to go past the first unfenced entry, since
//! the GPU may still be about to use it.
//!
//! The allocator lock protects the free list, the LRU and the node bookkeeping. It is the only
//! lock held across the search/evict loop and it is always dropped while waiting for a fence.

use crate::debug::*;
use crate::error::{Result, TtmError};
use crate::fence::{FenceDriver, FenceValue, WaitPolicy};
use crate::mm::{self, AllocInner, InsertMode, MmGuard, NodeId};
use crate::region::{BackendFactory, Region, RegionState};
use crate::sarea::{Sarea, MAX_FENCE_TYPES};

use parking_lot::MutexGuard;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

const DEBUG_CLASS: DebugFlags = DebugFlags::Aperture;

/// Per-node residency bookkeeping.
pub struct MmPriv {
    fence: FenceValue,
    fence_type: u32,
    fence_valid: bool,
    region: Weak<Region>,
}

#[derive(Copy, Clone, Debug, Default)]
struct Link {
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// Doubly linked LRU list over allocator nodes.
#[derive(Default)]
pub struct Lru {
    links: BTreeMap<NodeId, Link>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl Lru {
    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn contains(&self, id: NodeId) -> bool {
        self.links.contains_key(&id)
    }

    fn front(&self) -> Option<NodeId> {
        self.head
    }

    fn back(&self) -> Option<NodeId> {
        self.tail
    }

    fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.links.get(&id).and_then(|l| l.prev)
    }

    /// Iterates from the oldest entry to the newest.
    fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        core::iter::successors(self.head, move |id| self.links.get(id).and_then(|l| l.next))
    }

    fn unlink(&mut self, id: NodeId) -> bool {
        let link = match self.links.remove(&id) {
            Some(link) => link,
            None => return false,
        };
        match link.prev {
            Some(prev) => {
                if let Some(l) = self.links.get_mut(&prev) {
                    l.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(l) = self.links.get_mut(&next) {
                    l.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }
        true
    }

    /// Inserts `id` right before `before`, or at the tail.
    fn insert_before(&mut self, id: NodeId, before: Option<NodeId>) {
        self.unlink(id);
        let before = before.filter(|b| self.links.contains_key(b));
        let prev = match before {
            Some(b) => self.prev(b),
            None => self.tail,
        };

        self.links.insert(id, Link { prev, next: before });
        match prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(&p) {
                    l.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match before {
            Some(b) => {
                if let Some(l) = self.links.get_mut(&b) {
                    l.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
    }

    fn push_back(&mut self, id: NodeId) {
        self.insert_before(id, None);
    }
}

impl<T> AllocInner<T> for Lru {
    fn drop_object(&mut self, id: NodeId, _start: u64, _size: u64, _object: &mut T) {
        self.unlink(id);
    }
}

type Guard<'a> = MmGuard<'a, Lru, MmPriv>;

/// One GART aperture and the regions resident in it.
pub struct Aperture {
    mm: mm::Allocator<Lru, MmPriv>,
    fence: Arc<dyn FenceDriver>,
    backend: Arc<dyn BackendFactory>,
    sarea: Arc<Sarea>,
    policy: WaitPolicy,
}

crate::no_debug!(Aperture);

impl Aperture {
    /// Creates an aperture manager over aperture pages `[start, start + num_pages)`.
    pub fn new(
        start: u64,
        num_pages: u64,
        fence: Arc<dyn FenceDriver>,
        backend: Arc<dyn BackendFactory>,
        sarea: Arc<Sarea>,
        policy: WaitPolicy,
    ) -> Result<Arc<Aperture>> {
        if start
            .checked_add(num_pages)
            .map_or(true, |end| end > backend.aperture_pages())
        {
            return Err(TtmError::InvalidArgument("tt range outside aperture"));
        }
        if fence.fence_types() as usize > MAX_FENCE_TYPES {
            return Err(TtmError::InvalidArgument("too many fence types"));
        }

        mod_pr_debug!(
            "Aperture: managing pages [{:#x}, {:#x})",
            start,
            start + num_pages
        );
        Ok(Arc::new(Aperture {
            mm: mm::Allocator::new(start, num_pages, Lru::default())?,
            fence,
            backend,
            sarea,
            policy,
        }))
    }

    /// Returns the backend factory regions of this aperture use.
    pub fn backend(&self) -> &Arc<dyn BackendFactory> {
        &self.backend
    }

    /// Returns the fence driver.
    pub fn fence_driver(&self) -> &Arc<dyn FenceDriver> {
        &self.fence
    }

    /// Returns the shared area counters are published to.
    pub fn sarea(&self) -> &Arc<Sarea> {
        &self.sarea
    }

    /// Returns the number of free aperture pages.
    pub fn free_pages(&self) -> u64 {
        self.mm.lock().free_space()
    }

    /// Returns the number of regions holding aperture space.
    pub fn resident_count(&self) -> usize {
        self.mm.lock().node_count()
    }

    /// Returns true if no region holds aperture space.
    pub fn is_clean(&self) -> bool {
        self.mm.lock().clean()
    }

    /// Returns the evictable regions, oldest first.
    pub fn lru_regions(&self) -> Vec<Arc<Region>> {
        let mm = self.mm.lock();
        mm.user()
            .iter()
            .filter_map(|id| mm.node(id))
            .filter_map(|n| n.inner().region.upgrade())
            .collect()
    }

    /// Returns the current fence of a resident region.
    pub fn region_fence(&self, region: &Region) -> Option<(u32, FenceValue)> {
        let mm = self.mm.lock();
        let id = region.inner.lock().mm_node?;
        mm.node(id)
            .map(|n| n.inner())
            .filter(|p| p.fence_valid)
            .map(|p| (p.fence_type, p.fence))
    }

    fn fence_of(mm: &Guard<'_>, id: NodeId) -> Option<(u32, FenceValue, bool)> {
        mm.node(id).map(|n| {
            let p = n.inner();
            (p.fence_type, p.fence, p.fence_valid)
        })
    }

    /// Puts a node back on the LRU: fenced nodes go after every other fenced node, unfenced nodes
    /// at the tail.
    fn relink(mm: &mut Guard<'_>, id: NodeId) {
        let (lru, nodes) = mm.split_mut();
        let fenced = nodes.get(&id).map_or(false, |n| n.inner().fence_valid);
        if fenced {
            lru.unlink(id);
            let before = lru
                .iter()
                .find(|other| nodes.get(other).map_or(false, |n| !n.inner().fence_valid));
            lru.insert_before(id, before);
        } else {
            lru.push_back(id);
        }
    }

    /// Waits for a fence with the allocator lock dropped, then publishes the retired counter.
    fn wait_locked(&self, mm: &mut Guard<'_>, fence_type: u32, seq: FenceValue) -> Result {
        if !self.fence.test(fence_type, seq.0)? {
            cls_pr_debug!(Fence, "Aperture: waiting for {}:{:#x}", fence_type, seq.0);
            let res = MutexGuard::unlocked(mm, || self.fence.wait(fence_type, seq.0, &self.policy));
            if let Err(TtmError::HardwareTimeout) = res {
                log::error!(
                    "Aperture: fence {}:{:#x} timed out, GPU may be hung",
                    fence_type,
                    seq.0
                );
            }
            res?;
        }
        self.sarea
            .set_retired(fence_type, self.fence.retired(fence_type)?);
        Ok(())
    }

    /// Evicts the oldest fenced LRU entry, waiting for its fence first.
    ///
    /// The lock is dropped during the wait; if the LRU head changed meanwhile, this returns
    /// without evicting and the caller simply searches again.
    fn evict_oldest_locked(&self, mm: &mut Guard<'_>) -> Result {
        let id = match mm.user().front() {
            Some(id) => id,
            None => {
                log::warn!("Aperture: out of aperture space, nothing evictable");
                return Err(TtmError::OutOfApertureSpace);
            }
        };
        let (fence_type, seq, valid) = Self::fence_of(mm, id).ok_or(TtmError::InvalidState)?;
        if !valid {
            log::warn!("Aperture: out of aperture space, oldest entry is not fenced");
            return Err(TtmError::OutOfApertureSpace);
        }

        self.wait_locked(mm, fence_type, seq)?;
        if mm.user().front() != Some(id) || Self::fence_of(mm, id) != Some((fence_type, seq, true))
        {
            return Ok(());
        }

        let region = mm.node(id).and_then(|n| n.inner().region.upgrade());
        if let Some(region) = region.as_ref() {
            let mut inner = region.inner.lock();
            inner.evict()?;
            inner.mm_node = None;
            if inner.state == RegionState::Evicted {
                inner.state = RegionState::Unbound;
            }
        }
        mm.put_block(id);
        self.sarea.bump_evict_tt();

        cls_pr_debug!(
            Evict,
            "Aperture: evicted region {} (fence {}:{:#x})",
            region.as_ref().map_or(0, |r| r.handle()),
            fence_type,
            seq.0
        );
        Ok(())
    }

    /// Makes a region resident and bound, and returns its aperture page offset.
    ///
    /// A region without aperture space gets some, evicting fenced LRU entries as needed. The
    /// region's fence is invalidated until the next `fence_regions` and, unless pinned, it moves
    /// to the LRU tail. If binding fails the aperture space is released again.
    pub fn validate(&self, region: &Arc<Region>, fence_type: u32) -> Result<u64> {
        if fence_type >= self.fence.fence_types() {
            return Err(TtmError::InvalidArgument("fence type"));
        }

        let mut mm = self.mm.lock();
        let (existing, num_pages, pinned) = {
            let inner = region.inner.lock();
            if inner.state == RegionState::Destroyed {
                return Err(TtmError::InvalidState);
            }
            (inner.mm_node, inner.num_pages() as u64, inner.pinned)
        };

        let id = match existing {
            Some(id) => id,
            None => {
                if num_pages > mm.range_size() {
                    log::warn!(
                        "Aperture: region of {} pages can never fit the aperture",
                        num_pages
                    );
                    return Err(TtmError::OutOfApertureSpace);
                }
                let hole = loop {
                    if let Some(hole) = mm.search_free(num_pages, 0, InsertMode::Best) {
                        break hole;
                    }
                    self.evict_oldest_locked(&mut mm)?;
                };
                let object = MmPriv {
                    fence: FenceValue(0),
                    fence_type,
                    fence_valid: false,
                    region: Arc::downgrade(region),
                };
                mm.get_block(hole, object, 0)?
            }
        };

        let offset = {
            let node = mm.node_mut(id).ok_or(TtmError::InvalidState)?;
            let object = node.inner_mut();
            object.fence_valid = false;
            object.fence_type = fence_type;
            node.start()
        };
        if pinned {
            mm.user_mut().unlink(id);
        } else {
            mm.user_mut().push_back(id);
        }

        let mut inner = region.inner.lock();
        let res = match inner.state {
            RegionState::Unbound => inner.bind(offset),
            RegionState::Evicted => inner.rebind(offset),
            RegionState::Bound => Ok(()),
            RegionState::Destroyed => Err(TtmError::InvalidState),
        };
        match res {
            Ok(()) => {
                inner.mm_node = Some(id);
                mod_pr_debug!(
                    "Aperture: region {} resident at {:#x}",
                    region.handle(),
                    offset
                );
                Ok(offset)
            }
            Err(e) => {
                inner.mm_node = None;
                if inner.state == RegionState::Evicted {
                    inner.state = RegionState::Unbound;
                }
                drop(inner);
                mm.put_block(id);
                Err(e)
            }
        }
    }

    /// Releases a region's aperture space, after waiting for its fence, and unbinds it.
    ///
    /// Does nothing if the region holds no space. An interrupted wait leaves everything in place.
    /// A timed out wait is logged and the space is released anyway.
    pub fn remove_region(&self, region: &Region) -> Result {
        let mut mm = self.mm.lock();
        loop {
            let id = match region.inner.lock().mm_node {
                Some(id) => id,
                None => return Ok(()),
            };
            let (fence_type, seq, valid) =
                Self::fence_of(&mm, id).ok_or(TtmError::InvalidState)?;

            if valid {
                match self.wait_locked(&mut mm, fence_type, seq) {
                    Ok(()) | Err(TtmError::HardwareTimeout) => {}
                    Err(e) => return Err(e),
                }
                if Self::fence_of(&mm, id) != Some((fence_type, seq, true)) {
                    continue;
                }
            }

            let mut inner = region.inner.lock();
            if inner.mm_node != Some(id) {
                continue;
            }
            inner.evict()?;
            inner.mm_node = None;
            if inner.state == RegionState::Evicted {
                inner.state = RegionState::Unbound;
            }
            drop(inner);
            mm.put_block(id);

            mod_pr_debug!("Aperture: released region {}", region.handle());
            return Ok(());
        }
    }

    /// Unbinds a region after waiting for its fence, keeping its aperture space reserved.
    pub fn evict_region(&self, region: &Region) -> Result {
        let mut mm = self.mm.lock();
        let id = match region.inner.lock().mm_node {
            Some(id) => id,
            None => return Ok(()),
        };
        let (fence_type, seq, valid) = Self::fence_of(&mm, id).ok_or(TtmError::InvalidState)?;
        if valid {
            self.wait_locked(&mut mm, fence_type, seq)?;
        }

        let mut inner = region.inner.lock();
        if inner.state == RegionState::Bound {
            inner.evict()?;
            self.sarea.bump_evict_tt();
            cls_pr_debug!(Evict, "Aperture: evicted region {} on request", region.handle());
        }
        Ok(())
    }

    /// Changes whether a region may be evicted, moving it on or off the LRU.
    pub fn set_pinned(&self, region: &Region, pinned: bool) {
        let mut mm = self.mm.lock();
        let node = {
            let mut inner = region.inner.lock();
            inner.pinned = pinned;
            inner.mm_node
        };
        if let Some(id) = node {
            if pinned {
                mm.user_mut().unlink(id);
            } else if !mm.user().contains(id) {
                Self::relink(&mut mm, id);
            }
        }
    }

    /// Gets one sequence number per fence type: a freshly emitted one, or the last one the
    /// driver emitted by itself.
    fn emit_batched(&self, types: &BTreeSet<u32>) -> Result<BTreeMap<u32, FenceValue>> {
        let kernel_emits = self.fence.kernel_emits_fences();
        let mut seqs = BTreeMap::new();
        for &fence_type in types {
            let seq = if kernel_emits {
                self.fence.last_emitted(fence_type)?
            } else {
                self.fence.emit(fence_type)?
            };
            self.sarea.set_emitted(fence_type, seq);
            seqs.insert(fence_type, FenceValue(seq));
        }
        Ok(seqs)
    }

    fn stamp(mm: &mut Guard<'_>, id: NodeId, seqs: &BTreeMap<u32, FenceValue>) {
        let Some(node) = mm.node_mut(id) else {
            return;
        };
        let object = node.inner_mut();
        let Some(seq) = seqs.get(&object.fence_type) else {
            return;
        };
        object.fence = *seq;
        object.fence_valid = true;

        if mm.user().contains(id) {
            Self::relink(mm, id);
        }
    }

    /// Fences a batch of resident regions.
    ///
    /// One sequence number is obtained per distinct fence type in the batch, and every region
    /// of that type is stamped with it. Regions without aperture space are skipped. Returns the
    /// sequence used for each type.
    pub fn fence_regions(&self, regions: &[Arc<Region>]) -> Result<BTreeMap<u32, FenceValue>> {
        let mut mm = self.mm.lock();
        let mut ids = Vec::new();
        ids.try_reserve(regions.len())?;
        for region in regions {
            if let Some(id) = region.inner.lock().mm_node {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        let types: BTreeSet<u32> = ids
            .iter()
            .filter_map(|id| Self::fence_of(&mm, *id).map(|(t, _, _)| t))
            .collect();
        let seqs = self.emit_batched(&types)?;
        for id in ids {
            Self::stamp(&mut mm, id, &seqs);
        }

        mod_pr_debug!("Aperture: fenced {} regions: {:?}", regions.len(), seqs);
        Ok(seqs)
    }

    /// Fences every unfenced LRU entry, newest first back to the first fenced one, so that they
    /// become evictable. Returns how many entries were stamped.
    pub fn fence_lru_periodic(&self) -> Result<usize> {
        let mut mm = self.mm.lock();
        let mut ids = Vec::new();
        let mut cur = mm.user().back();
        while let Some(id) = cur {
            match Self::fence_of(&mm, id) {
                Some((_, _, false)) => ids.push(id),
                _ => break,
            }
            cur = mm.user().prev(id);
        }
        if ids.is_empty() {
            return Ok(0);
        }
        ids.reverse();

        let types: BTreeSet<u32> = ids
            .iter()
            .filter_map(|id| Self::fence_of(&mm, *id).map(|(t, _, _)| t))
            .collect();
        let seqs = self.emit_batched(&types)?;
        for id in ids.iter() {
            Self::stamp(&mut mm, *id, &seqs);
        }

        mod_pr_debug!("Aperture: periodic fence stamped {} entries", ids.len());
        Ok(ids.len())
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Bindable regions
//!
//! A region is a page range of a [`Ttm`] (or of pinned client memory) that can be bound into the
//! aperture through a hardware [`Backend`]. It owns the bind state machine:
//!
//! ```text
//!   Unbound --bind--> Bound --evict--> Evicted --rebind--> Bound
//!      any state --destroy--> Destroyed
//! ```
//!
//! A region holds an aperture node exactly while it is `Bound` or `Evicted`. Nodes are handed out
//! and taken back by the [`Aperture`], which also drives every bind/unbind; the locking order is
//! aperture allocator lock, then region lock, then TTM lock.

use crate::aperture::Aperture;
use crate::debug::*;
use crate::error::{Result, TtmError};
use crate::fence::FenceValue;
use crate::mem::{self, AddressSpace, Page, PAGE_SHIFT, PAGE_SIZE};
use crate::mm::NodeId;
use crate::object::Ttm;
use crate::util::align_down;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Region;

static REGION_ID: AtomicU64 = AtomicU64::new(0);

/// A hardware backend that makes a page list visible to the GPU through the aperture.
pub trait Backend: Send {
    /// True if the pages must be made uncached before binding.
    fn needs_cache_adjust(&self) -> bool;

    /// Takes the page list the backend will bind.
    fn populate(&mut self, pages: &[Arc<Page>]) -> Result;

    /// Binds the page list at aperture page `aper_offset`.
    fn bind(&mut self, aper_offset: u64) -> Result;

    /// Removes the binding.
    fn unbind(&mut self) -> Result;

    /// Drops the page list.
    fn clear(&mut self);

    /// Releases everything the backend holds.
    fn destroy(&mut self);
}

/// Creates backends for one aperture.
pub trait BackendFactory: Send + Sync {
    /// Creates a backend for a region with the given caching.
    fn create_backend(&self, cached: bool) -> Result<Box<dyn Backend>>;

    /// Total size of the aperture this factory binds into, in pages.
    fn aperture_pages(&self) -> u64;
}

/// Bind state of a region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegionState {
    Unbound,
    Bound,
    Evicted,
    Destroyed,
}

/// What a region's pages belong to.
pub(crate) enum RegionOwner {
    Ttm(Arc<Ttm>),
    /// Pinned client memory, owned by the client's file.
    User { file_id: u64, addr: u64 },
}

/// Inner data of a region, protected by its lock.
pub(crate) struct RegionInner {
    pub(crate) owner: RegionOwner,
    page_offset: usize,
    num_pages: usize,
    pages: Vec<Arc<Page>>,
    be: Box<dyn Backend>,
    pub(crate) mm_node: Option<NodeId>,
    aper_offset: Option<u64>,
    pub(crate) pinned: bool,
    pub(crate) state: RegionState,
}

impl RegionInner {
    pub(crate) fn num_pages(&self) -> usize {
        self.num_pages
    }

    fn ttm(&self) -> Option<&Arc<Ttm>> {
        match &self.owner {
            RegionOwner::Ttm(ttm) => Some(ttm),
            RegionOwner::User { .. } => None,
        }
    }

    fn set_uncached(&self, uncached: bool) {
        if uncached {
            mem::set_pages_uncached(self.pages.iter());
        } else {
            mem::set_pages_cached(self.pages.iter());
        }
        if let Some(ttm) = self.ttm() {
            ttm.mark_uncached(self.page_offset, self.num_pages, uncached);
        }
    }

    /// Binds the backend at `aper_offset`.
    ///
    /// Caching is turned off (with CPU mappings zapped first) before the backend sees the pages.
    /// On backend failure the binding and caching change are unwound and the state is unchanged.
    pub(crate) fn bind(&mut self, aper_offset: u64) -> Result {
        if matches!(self.state, RegionState::Bound | RegionState::Destroyed) {
            return Err(TtmError::InvalidState);
        }

        let adjust = self.be.needs_cache_adjust();
        if adjust {
            if let Some(ttm) = self.ttm() {
                ttm.zap_vmas(self.page_offset, self.num_pages);
            }
            self.set_uncached(true);
        }

        if let Err(e) = self.be.bind(aper_offset) {
            mod_pr_debug!("Region: bind at {:#x} failed: {}", aper_offset, e);
            if let Err(e) = self.be.unbind() {
                mod_pr_debug!("Region: unwind unbind failed: {}", e);
            }
            if adjust {
                self.set_uncached(false);
            }
            return Err(e);
        }

        if let Some(ttm) = self.ttm() {
            ttm.stamp_aperture(self.page_offset, self.num_pages, Some(aper_offset));
        }
        self.aper_offset = Some(aper_offset);
        self.state = RegionState::Bound;
        Ok(())
    }

    /// Binds an evicted region again, possibly at a different offset.
    pub(crate) fn rebind(&mut self, aper_offset: u64) -> Result {
        if self.state != RegionState::Evicted {
            return Err(TtmError::InvalidState);
        }
        self.bind(aper_offset)
    }

    /// Removes the backend binding of a bound region and restores caching. No-op otherwise.
    pub(crate) fn evict(&mut self) -> Result {
        if self.state != RegionState::Bound {
            return Ok(());
        }

        let adjust = self.be.needs_cache_adjust();
        if adjust {
            if let Some(ttm) = self.ttm() {
                ttm.zap_vmas(self.page_offset, self.num_pages);
            }
        }
        self.be.unbind()?;
        if adjust {
            self.set_uncached(false);
        }

        if let Some(ttm) = self.ttm() {
            ttm.stamp_aperture(self.page_offset, self.num_pages, None);
        }
        self.aper_offset = None;
        self.state = RegionState::Evicted;
        Ok(())
    }
}

/// A bindable region.
pub struct Region {
    id: u64,
    handle: AtomicU32,
    aperture: Arc<Aperture>,
    pub(crate) inner: Mutex<RegionInner>,
}

crate::no_debug!(Region);

impl Region {
    fn new(
        aperture: &Arc<Aperture>,
        owner: RegionOwner,
        page_offset: usize,
        be: Box<dyn Backend>,
        pages: Vec<Arc<Page>>,
        num_pages: usize,
    ) -> Arc<Region> {
        Arc::new(Region {
            id: REGION_ID.fetch_add(1, Ordering::Relaxed),
            handle: AtomicU32::new(0),
            aperture: aperture.clone(),
            inner: Mutex::new(RegionInner {
                owner,
                page_offset,
                num_pages,
                pages,
                be,
                mm_node: None,
                aper_offset: None,
                pinned: false,
                state: RegionState::Unbound,
            }),
        })
    }

    /// Carves a region out of pages `[page_offset, page_offset + num_pages)` of a TTM.
    ///
    /// The range must lie inside the TTM and must not overlap any other region of it. Missing
    /// backing pages are allocated. If anything fails after the range was claimed, the region is
    /// torn down through `destroy`, which releases the claim.
    pub fn create(
        aperture: &Arc<Aperture>,
        ttm: &Arc<Ttm>,
        page_offset: usize,
        num_pages: usize,
        cached: bool,
    ) -> Result<Arc<Region>> {
        ttm.claim_range(page_offset, num_pages)?;

        let be = match aperture.backend().create_backend(cached) {
            Ok(be) => be,
            Err(e) => {
                ttm.release_range(page_offset, num_pages);
                return Err(e);
            }
        };

        let region = Region::new(
            aperture,
            RegionOwner::Ttm(ttm.clone()),
            page_offset,
            be,
            Vec::new(),
            num_pages,
        );

        let populated = ttm.link_region(&region).and_then(|_| {
            let pages = ttm.populate_range(page_offset, num_pages)?;
            let mut inner = region.inner.lock();
            inner.be.populate(&pages)?;
            inner.pages = pages;
            Ok(())
        });
        if let Err(e) = populated {
            mod_pr_debug!("Region[{}]: populate failed: {}", region.id, e);
            if let Err(e) = region.destroy() {
                log::warn!("Region[{}]: rollback failed: {}", region.id, e);
            }
            return Err(e);
        }

        mod_pr_debug!(
            "Region[{}]: created over ttm pages [{}, {}), cached {}",
            region.id,
            page_offset,
            page_offset + num_pages,
            cached
        );
        Ok(region)
    }

    /// Creates a region over `len` bytes of client memory at `addr`, owned by client `file_id`.
    ///
    /// The range is widened to whole pages and pinned. Fails with `InvalidBuffer` if any page of
    /// it is not mapped. User regions always keep normal caching.
    pub fn create_user(
        aperture: &Arc<Aperture>,
        aspace: &AddressSpace,
        file_id: u64,
        addr: u64,
        len: u64,
    ) -> Result<Arc<Region>> {
        let end = addr
            .checked_add(len)
            .filter(|_| len > 0)
            .ok_or(TtmError::InvalidArgument("user range"))?;
        let start = align_down(addr, PAGE_SIZE as u64);
        let end = end
            .checked_next_multiple_of(PAGE_SIZE as u64)
            .ok_or(TtmError::InvalidArgument("user range"))?;
        let num_pages = ((end - start) >> PAGE_SHIFT) as usize;

        let pages = aspace.get_user_pages(start, num_pages)?;
        if pages.len() < num_pages {
            mod_pr_debug!(
                "Region: pinned {} of {} user pages at {:#x}",
                pages.len(),
                num_pages,
                start
            );
            mem::put_user_pages(&pages, false);
            return Err(TtmError::InvalidBuffer);
        }

        let mut be = match aperture.backend().create_backend(true) {
            Ok(be) => be,
            Err(e) => {
                mem::put_user_pages(&pages, false);
                return Err(e);
            }
        };
        if let Err(e) = be.populate(&pages) {
            be.destroy();
            mem::put_user_pages(&pages, false);
            return Err(e);
        }

        let region = Region::new(
            aperture,
            RegionOwner::User {
                file_id,
                addr: start,
            },
            0,
            be,
            pages,
            num_pages,
        );
        mod_pr_debug!(
            "Region[{}]: created over {} user pages at {:#x}",
            region.id,
            num_pages,
            start
        );
        Ok(region)
    }

    /// Returns the client-visible handle, or 0 if the region was never published.
    pub fn handle(&self) -> u32 {
        self.handle.load(Ordering::Relaxed)
    }

    pub(crate) fn set_handle(&self, handle: u32) {
        self.handle.store(handle, Ordering::Relaxed);
    }

    /// Returns the aperture this region binds into.
    pub fn aperture(&self) -> &Arc<Aperture> {
        &self.aperture
    }

    /// Returns the current state.
    pub fn state(&self) -> RegionState {
        self.inner.lock().state
    }

    /// Returns the aperture node held by the region, if any.
    pub fn mm_node(&self) -> Option<NodeId> {
        self.inner.lock().mm_node
    }

    /// Returns the aperture page offset the region is bound at.
    pub fn aper_offset(&self) -> Option<u64> {
        self.inner.lock().aper_offset
    }

    /// Returns the size of the region in pages.
    pub fn num_pages(&self) -> usize {
        self.inner.lock().num_pages
    }

    /// Returns true if the region is never chosen for eviction.
    pub fn pinned(&self) -> bool {
        self.inner.lock().pinned
    }

    /// Returns the TTM the region was carved from, or `None` for user regions.
    pub fn ttm(&self) -> Option<Arc<Ttm>> {
        self.inner.lock().ttm().cloned()
    }

    /// Returns the id of the client owning this region.
    pub fn owner_file(&self) -> u64 {
        match &self.inner.lock().owner {
            RegionOwner::Ttm(ttm) => ttm.owner(),
            RegionOwner::User { file_id, .. } => *file_id,
        }
    }

    /// Returns the client address of a user region.
    pub fn user_addr(&self) -> Option<u64> {
        match &self.inner.lock().owner {
            RegionOwner::Ttm(_) => None,
            RegionOwner::User { addr, .. } => Some(*addr),
        }
    }

    /// Returns the `(fence type, sequence)` the region was last fenced with, if the fence is
    /// still current.
    pub fn fence(&self) -> Option<(u32, FenceValue)> {
        self.aperture.region_fence(self)
    }

    /// Sets whether the region may be evicted.
    pub fn set_pinned(&self, pinned: bool) {
        self.aperture.set_pinned(self, pinned);
    }

    /// Makes the region resident and returns its aperture page offset.
    pub fn validate(self: &Arc<Self>, fence_type: u32) -> Result<u64> {
        self.aperture.validate(self, fence_type)
    }

    /// Waits for the GPU to finish with the region, then unbinds it and releases its aperture
    /// space.
    pub fn unbind(&self) -> Result {
        self.aperture.remove_region(self)
    }

    /// Waits for the GPU to finish with the region, then unbinds it while keeping its aperture
    /// space reserved, so the next validation binds it at the same offset.
    pub fn evict(&self) -> Result {
        self.aperture.evict_region(self)
    }

    /// Destroys the region.
    ///
    /// Waits for and releases the aperture reservation, unbinds, restores caching, frees the
    /// backend and hands the pages back: TTM pages lose their USED bit, user pages are released
    /// dirty. Destroying a destroyed region is a no-op.
    pub fn destroy(&self) -> Result {
        if self.inner.lock().state == RegionState::Destroyed {
            return Ok(());
        }

        self.aperture.remove_region(self)?;

        let mut inner = self.inner.lock();
        if inner.state == RegionState::Destroyed {
            return Ok(());
        }
        inner.evict()?;

        inner.be.clear();
        let pages = core::mem::take(&mut inner.pages);
        mem::set_pages_cached(pages.iter());
        inner.be.destroy();
        inner.state = RegionState::Destroyed;

        match &inner.owner {
            RegionOwner::Ttm(ttm) => {
                ttm.mark_uncached(inner.page_offset, inner.num_pages, false);
                ttm.release_range(inner.page_offset, inner.num_pages);
                ttm.unlink_region(self);
            }
            RegionOwner::User { .. } => mem::put_user_pages(&pages, true),
        }

        mod_pr_debug!("Region[{}]: destroyed", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agp::{AgpBackendFactory, Gart};
    use crate::fence::{SoftFence, WaitPolicy};
    use crate::mem::Caching;
    use crate::object::PageFlags;
    use crate::sarea::Sarea;

    fn setup(aper_pages: u64) -> (Arc<Aperture>, Arc<Gart>) {
        let gart = Gart::new(aper_pages).unwrap();
        let aperture = Aperture::new(
            0,
            aper_pages,
            Arc::new(SoftFence::new(1, false)),
            Arc::new(AgpBackendFactory::new(gart.clone())),
            Arc::new(Sarea::new()),
            WaitPolicy::default(),
        )
        .unwrap();
        (aperture, gart)
    }

    fn used(ttm: &Ttm) -> Vec<bool> {
        ttm.page_flags()
            .iter()
            .map(|f| f.contains(PageFlags::USED))
            .collect()
    }

    #[test]
    fn create_destroy_restores_used_mask() {
        let (aperture, _gart) = setup(16);
        let ttm = Ttm::create(8 * PAGE_SIZE as u64, 1).unwrap();
        let keep = Region::create(&aperture, &ttm, 0, 2, true).unwrap();
        let before = used(&ttm);

        let region = Region::create(&aperture, &ttm, 3, 4, false).unwrap();
        assert_ne!(used(&ttm), before);
        region.destroy().unwrap();
        assert_eq!(used(&ttm), before);
        assert_eq!(region.state(), RegionState::Destroyed);
        assert_eq!(ttm.region_count(), 1);

        // Destroying twice is harmless.
        region.destroy().unwrap();
        keep.destroy().unwrap();
    }

    #[test]
    fn overlap_scenario() {
        let (aperture, _gart) = setup(16);
        let ttm = Ttm::create(10 * PAGE_SIZE as u64, 1).unwrap();
        let a = Region::create(&aperture, &ttm, 0, 4, true).unwrap();
        let b = Region::create(&aperture, &ttm, 4, 4, true).unwrap();
        let overlap = Some(TtmError::InvalidArgument("region overlap"));
        assert_eq!(Region::create(&aperture, &ttm, 2, 4, true).err(), overlap);

        // Pages 4 and 5 still belong to B.
        a.destroy().unwrap();
        assert_eq!(Region::create(&aperture, &ttm, 2, 4, true).err(), overlap);
        let c = Region::create(&aperture, &ttm, 0, 4, true).unwrap();

        c.destroy().unwrap();
        b.destroy().unwrap();
        assert!(Region::create(&aperture, &ttm, 2, 4, true).is_ok());
        assert!(Region::create(&aperture, &ttm, 8, 3, true).is_err());
    }

    #[test]
    fn bind_uncached_and_evict() {
        let (aperture, gart) = setup(16);
        let ttm = Ttm::create(4 * PAGE_SIZE as u64, 1).unwrap();
        let vma = ttm.map().unwrap();
        vma.fault(0).unwrap();
        assert_eq!(vma.pte(0), Some(Caching::Cached));

        let region = Region::create(&aperture, &ttm, 0, 2, false).unwrap();
        let off = region.validate(0).unwrap();
        assert_eq!(region.state(), RegionState::Bound);
        assert!(region.mm_node().is_some());
        // The stale cached mapping was zapped before caching changed.
        assert_eq!(vma.pte(0), None);
        assert_eq!(vma.fault(0).unwrap().caching(), Caching::Uncached);
        assert!(ttm.page_flags()[0].contains(PageFlags::UNCACHED));
        assert_eq!(ttm.aper_page(1), Some(off + 1));
        assert!(Arc::ptr_eq(
            &gart.entry(off).unwrap(),
            &ttm.page(0).unwrap()
        ));

        region.evict().unwrap();
        assert_eq!(region.state(), RegionState::Evicted);
        assert!(region.mm_node().is_some());
        assert!(gart.entry(off).is_none());
        assert_eq!(ttm.page(0).unwrap().caching(), Caching::Cached);
        assert!(!ttm.page_flags()[0].contains(PageFlags::UNCACHED));

        // Rebinding reuses the reservation.
        assert_eq!(region.validate(0).unwrap(), off);
        assert_eq!(region.state(), RegionState::Bound);

        region.unbind().unwrap();
        assert_eq!(region.state(), RegionState::Unbound);
        assert!(region.mm_node().is_none());
        drop(vma);
    }

    #[test]
    fn user_region_pins_pages() {
        let (aperture, gart) = setup(16);
        let aspace = AddressSpace::new();
        let addr = aspace.map_anonymous(3 * PAGE_SIZE).unwrap();

        let region =
            Region::create_user(&aperture, &aspace, 9, addr + 16, 2 * PAGE_SIZE as u64).unwrap();
        assert_eq!(region.num_pages(), 3);
        assert_eq!(region.owner_file(), 9);
        assert_eq!(region.user_addr(), Some(addr));
        let pages = aspace.get_user_pages(addr, 3).unwrap();
        assert!(pages.iter().all(|p| p.pin_count() == 2));
        mem::put_user_pages(&pages, false);

        let off = region.validate(0).unwrap();
        assert!(gart.entry(off + 2).is_some());
        assert!(pages.iter().all(|p| p.caching() == Caching::Cached));

        region.destroy().unwrap();
        assert!(pages.iter().all(|p| p.pin_count() == 0 && p.is_dirty()));
        assert_eq!(gart.bound_pages(), 0);

        // Running past the end of the mapping fails to pin.
        assert_eq!(
            Region::create_user(&aperture, &aspace, 9, addr, 4 * PAGE_SIZE as u64).err(),
            Some(TtmError::InvalidBuffer)
        );
        assert!(pages.iter().all(|p| p.pin_count() == 0));
    }

    #[test]
    fn user_range_at_top_of_address_space() {
        let (aperture, gart) = setup(16);
        let aspace = AddressSpace::new();
        let bad = Some(TtmError::InvalidArgument("user range"));

        // The end rounds up past the last page.
        assert_eq!(
            Region::create_user(&aperture, &aspace, 1, u64::MAX - 100, 10).err(),
            bad
        );
        assert_eq!(
            Region::create_user(&aperture, &aspace, 1, u64::MAX - 10, 100).err(),
            bad
        );
        assert_eq!(Region::create_user(&aperture, &aspace, 1, 0, 0).err(), bad);
        // Ends on the last page boundary: in range, but nothing is mapped there.
        assert_eq!(
            Region::create_user(&aperture, &aspace, 1, u64::MAX - 8191, 4096).err(),
            Some(TtmError::InvalidBuffer)
        );
        assert_eq!(gart.bound_pages(), 0);
    }

    #[test]
    fn ttm_destroy_takes_regions() {
        let (aperture, gart) = setup(16);
        let ttm = Ttm::create(4 * PAGE_SIZE as u64, 1).unwrap();
        let a = Region::create(&aperture, &ttm, 0, 2, false).unwrap();
        let b = Region::create(&aperture, &ttm, 2, 2, true).unwrap();
        a.validate(0).unwrap();
        b.validate(0).unwrap();
        let page = ttm.page(0).unwrap();
        assert_eq!(page.caching(), Caching::Uncached);

        ttm.destroy().unwrap();
        assert_eq!(a.state(), RegionState::Destroyed);
        assert_eq!(b.state(), RegionState::Destroyed);
        assert_eq!(page.caching(), Caching::Cached);
        assert_eq!(gart.bound_pages(), 0);
        assert!(aperture.is_clean());
        assert!(Region::create(&aperture, &ttm, 0, 1, true).is_err());
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! TTM objects
//!
//! A TTM is a collection of backing pages that is not bound anywhere by itself. Bindable
//! sub-ranges of it are carved out as [`Region`]s, which may never overlap. The object keeps
//! per-page flags (whether a page belongs to a region, whether its caching was turned off for
//! the aperture, and where in the aperture it currently sits) and tracks every CPU mapping of
//! itself, so that mappings can be zapped before caching changes and so that destruction can be
//! deferred while any mapping is alive.

use crate::debug::*;
use crate::error::{Result, TtmError};
use crate::mem::{self, Caching, Page, PAGE_SIZE};
use crate::region::Region;

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

const DEBUG_CLASS: DebugFlags = DebugFlags::Object;

static TTM_ID: AtomicU64 = AtomicU64::new(0);
static VMA_ID: AtomicU64 = AtomicU64::new(0);

bitflags! {
    /// Per-page state of a TTM.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// The page belongs to exactly one live region.
        const USED = 1 << 0;
        /// The page's caching was turned off while bound to the aperture.
        const UNCACHED = 1 << 1;
    }
}

/// Flags plus the aperture page the page is bound at, if any.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct PageState {
    flags: PageFlags,
    aper_page: Option<u64>,
}

/// Inner data of a TTM, protected by its lock.
struct TtmInner {
    pages: Vec<Option<Arc<Page>>>,
    page_flags: Vec<PageState>,
    be_list: Vec<Weak<Region>>,
    /// VMA id -> populated page table entries (page index -> caching of the mapping).
    vmas: BTreeMap<u64, BTreeMap<usize, Caching>>,
    /// Region destruction is in progress; no new regions may be created.
    dying: bool,
    destroy_pending: bool,
    destroyed: bool,
}

/// A TTM object.
pub struct Ttm {
    id: u64,
    handle: AtomicU32,
    owner: u64,
    num_pages: usize,
    vma_count: AtomicUsize,
    inner: Mutex<TtmInner>,
}

crate::no_debug!(Ttm);

impl Ttm {
    /// Creates a TTM of `size` bytes, rounded up to whole pages, owned by client `owner`.
    ///
    /// Pages are not allocated until a region needs them.
    pub fn create(size: u64, owner: u64) -> Result<Arc<Ttm>> {
        if size == 0 {
            return Err(TtmError::InvalidArgument("empty ttm"));
        }
        let num_pages = usize::try_from(size.div_ceil(PAGE_SIZE as u64))
            .map_err(|_| TtmError::InvalidArgument("ttm size"))?;

        let mut page_flags = Vec::new();
        page_flags.try_reserve_exact(num_pages)?;
        page_flags.resize(num_pages, PageState::default());

        let mut pages = Vec::new();
        pages.try_reserve_exact(num_pages)?;
        pages.resize(num_pages, None);

        let id = TTM_ID.fetch_add(1, Ordering::Relaxed);
        mod_pr_debug!("Ttm[{}]: created, {} pages, owner {}", id, num_pages, owner);

        Ok(Arc::new(Ttm {
            id,
            handle: AtomicU32::new(0),
            owner,
            num_pages,
            vma_count: AtomicUsize::new(0),
            inner: Mutex::new(TtmInner {
                pages,
                page_flags,
                be_list: Vec::new(),
                vmas: BTreeMap::new(),
                dying: false,
                destroy_pending: false,
                destroyed: false,
            }),
        }))
    }

    /// Returns the client-visible handle, or 0 if the object was never published.
    pub fn handle(&self) -> u32 {
        self.handle.load(Ordering::Relaxed)
    }

    pub(crate) fn set_handle(&self, handle: u32) {
        self.handle.store(handle, Ordering::Relaxed);
    }

    /// Returns the id of the client that created this object.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Returns the size of the object in pages.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Returns the number of live CPU mappings.
    pub fn vma_count(&self) -> usize {
        self.vma_count.load(Ordering::Acquire)
    }

    /// Returns true once the object has been fully torn down.
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Returns true if destruction was requested while mapped and is waiting for the last VMA.
    pub fn destroy_pending(&self) -> bool {
        self.inner.lock().destroy_pending
    }

    /// Returns a copy of the per-page flags.
    pub fn page_flags(&self) -> Vec<PageFlags> {
        self.inner.lock().page_flags.iter().map(|s| s.flags).collect()
    }

    /// Returns the aperture page that page `index` is bound at.
    pub fn aper_page(&self, index: usize) -> Option<u64> {
        self.inner
            .lock()
            .page_flags
            .get(index)
            .and_then(|s| s.aper_page)
    }

    /// Returns the backing page at `index`, if it has been allocated.
    pub fn page(&self, index: usize) -> Option<Arc<Page>> {
        self.inner.lock().pages.get(index).cloned().flatten()
    }

    /// Returns the number of regions currently carved from this object.
    pub fn region_count(&self) -> usize {
        self.inner
            .lock()
            .be_list
            .iter()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    fn check_range(&self, page_offset: usize, num_pages: usize) -> Result<core::ops::Range<usize>> {
        let end = page_offset
            .checked_add(num_pages)
            .filter(|end| num_pages > 0 && *end <= self.num_pages)
            .ok_or(TtmError::InvalidArgument("region outside ttm"))?;
        Ok(page_offset..end)
    }

    /// Marks a page range USED for a new region.
    ///
    /// Fails if any page of the range already belongs to another region.
    pub(crate) fn claim_range(&self, page_offset: usize, num_pages: usize) -> Result {
        let range = self.check_range(page_offset, num_pages)?;
        let mut inner = self.inner.lock();
        if inner.dying || inner.destroyed || inner.destroy_pending {
            return Err(TtmError::InvalidState);
        }
        if inner.page_flags[range.clone()]
            .iter()
            .any(|s| s.flags.contains(PageFlags::USED))
        {
            mod_pr_debug!(
                "Ttm[{}]: range [{}, {}) overlaps a region",
                self.id,
                range.start,
                range.end
            );
            return Err(TtmError::InvalidArgument("region overlap"));
        }
        for state in inner.page_flags[range].iter_mut() {
            state.flags.insert(PageFlags::USED);
        }
        Ok(())
    }

    /// Clears USED on a page range released by a region.
    pub(crate) fn release_range(&self, page_offset: usize, num_pages: usize) {
        let mut inner = self.inner.lock();
        let end = (page_offset + num_pages).min(inner.page_flags.len());
        for state in inner.page_flags[page_offset.min(end)..end].iter_mut() {
            state.flags.remove(PageFlags::USED);
            state.aper_page = None;
        }
    }

    /// Allocates any missing backing pages of a range and returns the whole range.
    pub(crate) fn populate_range(&self, page_offset: usize, num_pages: usize) -> Result<Vec<Arc<Page>>> {
        let range = self.check_range(page_offset, num_pages)?;
        let mut out = Vec::new();
        out.try_reserve_exact(num_pages)?;

        let mut inner = self.inner.lock();
        for slot in inner.pages[range].iter_mut() {
            let page = match slot.clone() {
                Some(page) => page,
                None => {
                    let page = Page::alloc()?;
                    *slot = Some(page.clone());
                    page
                }
            };
            out.push(page);
        }
        Ok(out)
    }

    /// Tears down every CPU page table entry over a page range.
    pub(crate) fn zap_vmas(&self, page_offset: usize, num_pages: usize) {
        let mut inner = self.inner.lock();
        let mut zapped = 0;
        for ptes in inner.vmas.values_mut() {
            let before = ptes.len();
            ptes.retain(|index, _| !(page_offset..page_offset + num_pages).contains(index));
            zapped += before - ptes.len();
        }
        if zapped > 0 {
            mod_pr_debug!("Ttm[{}]: zapped {} ptes", self.id, zapped);
        }
    }

    /// Records whether a page range had its caching turned off.
    pub(crate) fn mark_uncached(&self, page_offset: usize, num_pages: usize, uncached: bool) {
        let mut inner = self.inner.lock();
        let end = (page_offset + num_pages).min(inner.page_flags.len());
        for state in inner.page_flags[page_offset.min(end)..end].iter_mut() {
            state.flags.set(PageFlags::UNCACHED, uncached);
        }
    }

    /// Records the aperture page of every page of a range, or clears it.
    pub(crate) fn stamp_aperture(&self, page_offset: usize, num_pages: usize, aper_offset: Option<u64>) {
        let mut inner = self.inner.lock();
        let end = (page_offset + num_pages).min(inner.page_flags.len());
        for (i, state) in inner.page_flags[page_offset.min(end)..end]
            .iter_mut()
            .enumerate()
        {
            state.aper_page = aper_offset.map(|base| base + i as u64);
        }
    }

    pub(crate) fn link_region(&self, region: &Arc<Region>) -> Result {
        let mut inner = self.inner.lock();
        inner.be_list.retain(|r| r.strong_count() > 0);
        inner.be_list.try_reserve(1)?;
        inner.be_list.push(Arc::downgrade(region));
        Ok(())
    }

    pub(crate) fn unlink_region(&self, region: &Region) {
        self.inner
            .lock()
            .be_list
            .retain(|r| r.strong_count() > 0 && !core::ptr::eq(r.as_ptr(), region));
    }

    /// Creates a CPU mapping of this object.
    pub fn map(self: &Arc<Self>) -> Result<Vma> {
        let mut inner = self.inner.lock();
        if inner.destroyed || inner.destroy_pending {
            return Err(TtmError::InvalidState);
        }
        let id = VMA_ID.fetch_add(1, Ordering::Relaxed);
        inner.vmas.insert(id, BTreeMap::new());
        self.vma_count.fetch_add(1, Ordering::AcqRel);
        mod_pr_debug!("Ttm[{}]: mapped as vma {}", self.id, id);

        Ok(Vma {
            id,
            ttm: self.clone(),
        })
    }

    /// Destroys the object.
    ///
    /// While any VMA maps the object this returns `Busy` and marks the destruction pending; the
    /// last VMA to go away then runs it. Otherwise every remaining region is destroyed, page
    /// caching is restored and the pages are freed. Calling this on a destroyed object is a
    /// no-op.
    pub fn destroy(&self) -> Result {
        let regions: Vec<Arc<Region>> = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Ok(());
            }
            if self.vma_count.load(Ordering::Acquire) > 0 {
                inner.destroy_pending = true;
                mod_pr_debug!("Ttm[{}]: destroy deferred, still mapped", self.id);
                return Err(TtmError::Busy);
            }
            inner.dying = true;
            inner.be_list.iter().filter_map(Weak::upgrade).collect()
        };

        for region in regions {
            if let Err(e) = region.destroy() {
                self.inner.lock().dying = false;
                return Err(e);
            }
        }

        let mut inner = self.inner.lock();
        let uncached: Vec<Arc<Page>> = inner
            .pages
            .iter()
            .zip(inner.page_flags.iter())
            .filter(|(_, s)| s.flags.contains(PageFlags::UNCACHED))
            .filter_map(|(p, _)| p.clone())
            .collect();
        mem::set_pages_cached(uncached.iter());

        inner.pages = Vec::new();
        inner.page_flags = Vec::new();
        inner.be_list = Vec::new();
        inner.destroy_pending = false;
        inner.destroyed = true;
        mod_pr_debug!("Ttm[{}]: destroyed", self.id);
        Ok(())
    }
}

/// A CPU mapping of a TTM.
///
/// Dropping the last mapping of an object whose destruction was deferred destroys it.
pub struct Vma {
    id: u64,
    ttm: Arc<Ttm>,
}

crate::no_debug!(Vma);

impl Vma {
    /// Returns the mapped object.
    pub fn ttm(&self) -> &Arc<Ttm> {
        &self.ttm
    }

    /// Handles a CPU fault on page `index`, allocating the page if needed, and installs a page
    /// table entry with the page's current caching.
    pub fn fault(&self, index: usize) -> Result<Arc<Page>> {
        let mut inner = self.ttm.inner.lock();
        if inner.destroyed {
            return Err(TtmError::InvalidState);
        }
        let slot = inner
            .pages
            .get_mut(index)
            .ok_or(TtmError::InvalidArgument("fault outside ttm"))?;
        let page = match slot.clone() {
            Some(page) => page,
            None => {
                let page = Page::alloc()?;
                *slot = Some(page.clone());
                page
            }
        };
        let caching = page.caching();
        if let Some(ptes) = inner.vmas.get_mut(&self.id) {
            ptes.insert(index, caching);
        }
        Ok(page)
    }

    /// Returns the caching of the page table entry for page `index`, if one is installed.
    pub fn pte(&self, index: usize) -> Option<Caching> {
        self.ttm
            .inner
            .lock()
            .vmas
            .get(&self.id)
            .and_then(|ptes| ptes.get(&index).copied())
    }
}

impl Drop for Vma {
    fn drop(&mut self) {
        let pending = {
            let mut inner = self.ttm.inner.lock();
            inner.vmas.remove(&self.id);
            self.ttm.vma_count.fetch_sub(1, Ordering::AcqRel) == 1 && inner.destroy_pending
        };

        if pending {
            mod_pr_debug!("Ttm[{}]: last vma closed, running deferred destroy", self.ttm.id);
            if let Err(e) = self.ttm.destroy() {
                log::warn!("Ttm[{}]: deferred destroy failed: {}", self.ttm.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rounds_to_pages() {
        let ttm = Ttm::create(PAGE_SIZE as u64 + 1, 7).unwrap();
        assert_eq!(ttm.num_pages(), 2);
        assert_eq!(ttm.owner(), 7);
        assert!(ttm.page(0).is_none());
        assert!(Ttm::create(0, 7).is_err());
    }

    #[test]
    fn claim_and_release() {
        let ttm = Ttm::create(10 * PAGE_SIZE as u64, 1).unwrap();
        ttm.claim_range(0, 4).unwrap();
        ttm.claim_range(4, 4).unwrap();
        assert_eq!(
            ttm.claim_range(2, 4),
            Err(TtmError::InvalidArgument("region overlap"))
        );
        assert!(ttm.claim_range(8, 3).is_err());
        ttm.release_range(0, 4);
        ttm.claim_range(2, 2).unwrap();

        let used: Vec<bool> = ttm
            .page_flags()
            .iter()
            .map(|f| f.contains(PageFlags::USED))
            .collect();
        assert_eq!(
            used,
            [false, false, true, true, true, true, true, true, false, false]
        );
    }

    #[test]
    fn fault_and_zap() {
        let ttm = Ttm::create(4 * PAGE_SIZE as u64, 1).unwrap();
        let vma = ttm.map().unwrap();
        let page = vma.fault(1).unwrap();
        assert!(Arc::ptr_eq(&page, &ttm.page(1).unwrap()));
        assert_eq!(vma.pte(1), Some(Caching::Cached));
        assert!(vma.fault(4).is_err());

        ttm.zap_vmas(0, 2);
        assert_eq!(vma.pte(1), None);
    }

    #[test]
    fn destroy_deferred_while_mapped() {
        let ttm = Ttm::create(PAGE_SIZE as u64, 1).unwrap();
        let a = ttm.map().unwrap();
        let b = ttm.map().unwrap();
        assert_eq!(ttm.vma_count(), 2);

        assert_eq!(ttm.destroy(), Err(TtmError::Busy));
        assert!(ttm.destroy_pending());
        assert!(ttm.map().is_err());

        drop(a);
        assert!(!ttm.is_destroyed());
        drop(b);
        assert!(ttm.is_destroyed());
        assert_eq!(ttm.vma_count(), 0);

        // Re-entering destroy after the deferred run is harmless.
        assert_eq!(ttm.destroy(), Ok(()));
    }

    #[test]
    fn destroy_restores_caching() {
        let ttm = Ttm::create(2 * PAGE_SIZE as u64, 1).unwrap();
        let pages = ttm.populate_range(0, 2).unwrap();
        mem::set_pages_uncached(pages.iter());
        ttm.mark_uncached(0, 2, true);

        ttm.destroy().unwrap();
        assert!(pages.iter().all(|p| p.caching() == Caching::Cached));
        assert!(ttm.page(0).is_none());
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Page-level memory operations.
//!
//! Backing pages, their CPU caching attributes, and the process address spaces clients pin user
//! memory from. Changing a page's caching attribute is always followed by a global TLB/cache
//! flush, and callers must zap CPU mappings of the affected pages first so no stale cached
//! mapping survives the change.

use crate::debug::*;
use crate::error::{Result, TtmError};

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Mem;

/// Number of bits in a page offset.
pub const PAGE_SHIFT: usize = 12;
/// CPU page size.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Page offset mask.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// First address handed out by `AddressSpace::map_anonymous`.
const USER_MAP_BASE: u64 = 0x1000_0000;

static FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);
static PAGE_ID: AtomicU64 = AtomicU64::new(0);

/// CPU caching attribute of a page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Caching {
    /// Normal write-back caching.
    Cached = 0,
    /// Uncached, as required for some GART bindings.
    Uncached = 1,
}

/// A single page of backing memory.
pub struct Page {
    id: u64,
    data: Mutex<Box<[u8]>>,
    caching: AtomicU8,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

crate::no_debug!(Page);

impl Page {
    /// Allocates a zeroed page.
    pub fn alloc() -> Result<Arc<Page>> {
        let mut data = Vec::new();
        data.try_reserve_exact(PAGE_SIZE)?;
        data.resize(PAGE_SIZE, 0u8);

        Ok(Arc::new(Page {
            id: PAGE_ID.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(data.into_boxed_slice()),
            caching: AtomicU8::new(Caching::Cached as u8),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Returns a unique id for this page, for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current caching attribute.
    pub fn caching(&self) -> Caching {
        match self.caching.load(Ordering::Acquire) {
            0 => Caching::Cached,
            _ => Caching::Uncached,
        }
    }

    /// Returns the number of outstanding pins.
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns true if the page was released dirty since the last `clear_dirty`.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clears the dirty bit.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Copies bytes out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= PAGE_SIZE)
            .ok_or(TtmError::InvalidArgument("page read out of bounds"))?;
        buf.copy_from_slice(&self.data.lock()[offset..end]);
        Ok(())
    }

    /// Copies bytes into the page.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result {
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= PAGE_SIZE)
            .ok_or(TtmError::InvalidArgument("page write out of bounds"))?;
        self.data.lock()[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn set_caching(&self, caching: Caching) {
        self.caching.store(caching as u8, Ordering::Release);
    }
}

/// Flush CPU caches and TLBs on all CPUs.
pub fn flush_tlb_all() {
    core::sync::atomic::fence(Ordering::SeqCst);
    FLUSH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Returns the number of global flushes performed so far.
pub fn flush_count() -> u64 {
    FLUSH_COUNT.load(Ordering::Relaxed)
}

/// Changes the caching attribute of a set of pages, then flushes.
fn change_caching<'a>(pages: impl Iterator<Item = &'a Arc<Page>>, caching: Caching) -> usize {
    let mut changed = 0;
    for page in pages {
        if page.caching() != caching {
            page.set_caching(caching);
            changed += 1;
        }
    }
    if changed > 0 {
        flush_tlb_all();
        mod_pr_debug!("mem: {} pages now {:?}", changed, caching);
    }
    changed
}

/// Marks pages uncached. Returns how many pages changed attribute.
pub fn set_pages_uncached<'a>(pages: impl Iterator<Item = &'a Arc<Page>>) -> usize {
    change_caching(pages, Caching::Uncached)
}

/// Restores normal caching on pages. Returns how many pages changed attribute.
pub fn set_pages_cached<'a>(pages: impl Iterator<Item = &'a Arc<Page>>) -> usize {
    change_caching(pages, Caching::Cached)
}

/// Releases pages pinned with `AddressSpace::get_user_pages`.
pub fn put_user_pages(pages: &[Arc<Page>], dirty: bool) {
    for page in pages {
        if dirty {
            page.dirty.store(true, Ordering::Release);
        }
        if page.pin_count.fetch_sub(1, Ordering::AcqRel) == 0 {
            log::error!("mem: unbalanced unpin of page {}", page.id);
            page.pin_count.store(0, Ordering::Release);
        }
    }
}

/// Inner data of an address space, protected by its lock.
struct AddressSpaceInner {
    /// Page frame number -> backing page.
    pages: BTreeMap<u64, Arc<Page>>,
    next: u64,
}

/// A client process address space.
pub struct AddressSpace {
    inner: Mutex<AddressSpaceInner>,
}

crate::no_debug!(AddressSpace);

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new() -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            inner: Mutex::new(AddressSpaceInner {
                pages: BTreeMap::new(),
                next: USER_MAP_BASE,
            }),
        })
    }

    /// Maps `len` bytes of fresh anonymous memory and returns its page-aligned address.
    pub fn map_anonymous(&self, len: usize) -> Result<u64> {
        if len == 0 {
            return Err(TtmError::InvalidArgument("empty mapping"));
        }
        let npages = len.div_ceil(PAGE_SIZE) as u64;

        let mut pages = Vec::new();
        pages.try_reserve_exact(npages as usize)?;
        for _ in 0..npages {
            pages.push(Page::alloc()?);
        }

        let mut inner = self.inner.lock();
        let addr = inner.next;
        // Leave an unmapped guard page after each mapping.
        inner.next += (npages + 1) << PAGE_SHIFT;
        for (i, page) in pages.into_iter().enumerate() {
            inner.pages.insert((addr >> PAGE_SHIFT) + i as u64, page);
        }

        mod_pr_debug!("mem: mapped {:#x} bytes at {:#x}", len, addr);
        Ok(addr)
    }

    /// Unmaps every page overlapping `[addr, addr + len)`.
    pub fn unmap(&self, addr: u64, len: usize) {
        let first = addr >> PAGE_SHIFT;
        let last = addr.saturating_add(len as u64).div_ceil(PAGE_SIZE as u64);
        let mut inner = self.inner.lock();
        for pfn in first..last {
            inner.pages.remove(&pfn);
        }
    }

    /// Copies `buf.len()` bytes from user address `addr`.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result {
        let inner = self.inner.lock();
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let offset = cur as usize & PAGE_MASK;
            let count = (PAGE_SIZE - offset).min(buf.len() - done);
            let page = inner
                .pages
                .get(&(cur >> PAGE_SHIFT))
                .ok_or(TtmError::InvalidBuffer)?;
            page.read(offset, &mut buf[done..done + count])?;
            done += count;
        }
        Ok(())
    }

    /// Copies `buf` to user address `addr`.
    pub fn write(&self, addr: u64, buf: &[u8]) -> Result {
        let inner = self.inner.lock();
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let offset = cur as usize & PAGE_MASK;
            let count = (PAGE_SIZE - offset).min(buf.len() - done);
            let page = inner
                .pages
                .get(&(cur >> PAGE_SHIFT))
                .ok_or(TtmError::InvalidBuffer)?;
            page.write(offset, &buf[done..done + count])?;
            done += count;
        }
        Ok(())
    }

    /// Pins up to `npages` consecutive pages starting at the page-aligned address `addr`.
    ///
    /// Stops at the first unmapped page, so the result may be shorter than requested.
    pub fn get_user_pages(&self, addr: u64, npages: usize) -> Result<Vec<Arc<Page>>> {
        if addr as usize & PAGE_MASK != 0 {
            return Err(TtmError::InvalidArgument("unaligned user address"));
        }

        let mut out = Vec::new();
        out.try_reserve_exact(npages)?;

        let inner = self.inner.lock();
        let first = addr >> PAGE_SHIFT;
        for pfn in first..first + npages as u64 {
            match inner.pages.get(&pfn) {
                Some(page) => {
                    page.pin_count.fetch_add(1, Ordering::AcqRel);
                    out.push(page.clone());
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_copy_across_pages() {
        let aspace = AddressSpace::new();
        let addr = aspace.map_anonymous(2 * PAGE_SIZE).unwrap();
        let data: Vec<u8> = (0..64).collect();
        let at = addr + PAGE_SIZE as u64 - 32;
        aspace.write(at, &data).unwrap();

        let mut back = vec![0u8; 64];
        aspace.read(at, &mut back).unwrap();
        assert_eq!(back, data);

        // The guard page after the mapping is not readable.
        let mut one = [0u8; 1];
        assert_eq!(
            aspace.read(addr + 2 * PAGE_SIZE as u64, &mut one),
            Err(TtmError::InvalidBuffer)
        );
    }

    #[test]
    fn pin_and_release() {
        let aspace = AddressSpace::new();
        let addr = aspace.map_anonymous(3 * PAGE_SIZE).unwrap();
        let pages = aspace.get_user_pages(addr, 5).unwrap();
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.pin_count() == 1));

        put_user_pages(&pages, true);
        assert!(pages.iter().all(|p| p.pin_count() == 0 && p.is_dirty()));

        assert!(aspace.get_user_pages(addr + 1, 1).is_err());
    }

    #[test]
    fn caching_changes_flush() {
        let pages = vec![Page::alloc().unwrap(), Page::alloc().unwrap()];
        let before = flush_count();
        assert_eq!(set_pages_uncached(pages.iter()), 2);
        assert!(flush_count() > before);
        assert!(pages.iter().all(|p| p.caching() == Caching::Uncached));
        assert_eq!(set_pages_uncached(pages.iter()), 0);
        assert_eq!(set_pages_cached(pages.iter()), 2);
        assert_eq!(pages[0].caching(), Caching::Cached);
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! AGP/GART aperture backend
//!
//! The GART is a flat translation table with one entry per aperture page; the GPU sees aperture
//! page `n` as whatever page entry `n` points at. Binding a region writes its pages into a
//! contiguous run of entries, unbinding clears them. Every table update is followed by a GART
//! TLB flush.

use crate::debug::*;
use crate::error::{Result, TtmError};
use crate::mem::Page;
use crate::region::{Backend, BackendFactory};

use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Agp;

/// The GART translation table.
pub struct Gart {
    num_pages: u64,
    entries: Mutex<Vec<Option<Arc<Page>>>>,
    flushes: AtomicU64,
}

crate::no_debug!(Gart);

impl Gart {
    /// Creates an empty GART of `num_pages` entries.
    pub fn new(num_pages: u64) -> Result<Arc<Gart>> {
        let count =
            usize::try_from(num_pages).map_err(|_| TtmError::InvalidArgument("gart size"))?;
        let mut entries = Vec::new();
        entries.try_reserve_exact(count)?;
        entries.resize(count, None);

        Ok(Arc::new(Gart {
            num_pages,
            entries: Mutex::new(entries),
            flushes: AtomicU64::new(0),
        }))
    }

    /// Returns the number of entries.
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Returns the page aperture page `aper_page` translates to.
    pub fn entry(&self, aper_page: u64) -> Option<Arc<Page>> {
        self.entries
            .lock()
            .get(aper_page as usize)
            .cloned()
            .flatten()
    }

    /// Returns the number of populated entries.
    pub fn bound_pages(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.is_some()).count()
    }

    /// Returns the number of GART TLB flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Reads through the aperture, as the GPU would.
    pub fn read(&self, aper_page: u64, offset: usize, buf: &mut [u8]) -> Result {
        self.entry(aper_page)
            .ok_or(TtmError::InvalidArgument("unbound aperture page"))?
            .read(offset, buf)
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Writes `pages` into the table starting at `pg_start`.
    ///
    /// Either every entry is written or none is.
    fn insert_memory(&self, pages: &[Arc<Page>], pg_start: u64) -> Result {
        let mut entries = self.entries.lock();
        let start = pg_start as usize;
        let end = start
            .checked_add(pages.len())
            .filter(|end| *end <= entries.len())
            .ok_or(TtmError::InvalidArgument("gart range"))?;

        if let Some(busy) = entries[start..end].iter().position(Option::is_some) {
            mod_pr_debug!("Gart: entry {:#x} already in use", start + busy);
            return Err(TtmError::Busy);
        }

        for (entry, page) in entries[start..end].iter_mut().zip(pages) {
            *entry = Some(page.clone());
        }
        self.flush();

        mod_pr_debug!("Gart: bound {} pages at {:#x}", pages.len(), pg_start);
        Ok(())
    }

    /// Clears `count` entries starting at `pg_start`.
    fn remove_memory(&self, pg_start: u64, count: usize) -> Result {
        let mut entries = self.entries.lock();
        let start = pg_start as usize;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= entries.len())
            .ok_or(TtmError::InvalidArgument("gart range"))?;

        for entry in entries[start..end].iter_mut() {
            *entry = None;
        }
        self.flush();

        mod_pr_debug!("Gart: unbound {} pages at {:#x}", count, pg_start);
        Ok(())
    }
}

/// A region's binding in the GART.
pub struct AgpBackend {
    gart: Arc<Gart>,
    cached: bool,
    pages: Vec<Arc<Page>>,
    bound_at: Option<u64>,
}

crate::no_debug!(AgpBackend);

impl Backend for AgpBackend {
    fn needs_cache_adjust(&self) -> bool {
        !self.cached
    }

    fn populate(&mut self, pages: &[Arc<Page>]) -> Result {
        self.pages.try_reserve_exact(pages.len())?;
        self.pages.extend(pages.iter().cloned());
        Ok(())
    }

    fn bind(&mut self, aper_offset: u64) -> Result {
        if self.bound_at.is_some() {
            return Err(TtmError::InvalidState);
        }
        self.gart.insert_memory(&self.pages, aper_offset)?;
        self.bound_at = Some(aper_offset);
        Ok(())
    }

    fn unbind(&mut self) -> Result {
        if let Some(offset) = self.bound_at {
            self.gart.remove_memory(offset, self.pages.len())?;
            self.bound_at = None;
        }
        Ok(())
    }

    fn clear(&mut self) {
        if let Err(e) = self.unbind() {
            log::warn!("AgpBackend: unbind on clear failed: {}", e);
        }
        self.pages = Vec::new();
    }

    fn destroy(&mut self) {
        self.clear();
    }
}

/// Creates AGP backends binding into one GART.
pub struct AgpBackendFactory {
    gart: Arc<Gart>,
}

impl AgpBackendFactory {
    /// Creates a factory for `gart`.
    pub fn new(gart: Arc<Gart>) -> AgpBackendFactory {
        AgpBackendFactory { gart }
    }
}

impl BackendFactory for AgpBackendFactory {
    fn create_backend(&self, cached: bool) -> Result<Box<dyn Backend>> {
        Ok(Box::new(AgpBackend {
            gart: self.gart.clone(),
            cached,
            pages: Vec::new(),
            bound_at: None,
        }))
    }

    fn aperture_pages(&self) -> u64 {
        self.gart.num_pages()
    }
}

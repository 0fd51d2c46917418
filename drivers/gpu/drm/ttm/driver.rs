// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Top-level device implementation.
//!
//! A [`TtmDevice`] ties a chip configuration to its fence engine and aperture backend. The memory
//! manager proper (aperture, SAREA and the handle tables) only exists between `MM_INIT` and
//! `MM_TAKEDOWN`; every request made outside that window fails with `NoDevice`.

use crate::agp::{AgpBackendFactory, Gart};
use crate::aperture::Aperture;
use crate::debug::{self, *};
use crate::error::{Result, TtmError};
use crate::fence::{FenceDriver, SoftFence, WaitPolicy};
use crate::hashtab::HashTable;
use crate::hw::HwConfig;
use crate::object::Ttm;
use crate::region::{BackendFactory, Region, RegionState};
use crate::sarea::{Sarea, MAX_FENCE_TYPES, SAREA_HANDLE};

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;

const DEBUG_CLASS: DebugFlags = DebugFlags::Driver;

/// Device parameters, the equivalent of module parameters.
#[derive(Clone, Debug)]
pub struct Params {
    /// Initial value of the debug class bits (see [`DebugFlags`]).
    pub debug_flags: u64,
    /// Length of one fence wait slice.
    pub fence_timeout: Duration,
    /// Fence wait slices without progress before giving up.
    pub fence_retries: u32,
    /// Size of the handle key space, in bits (1 to 31).
    pub handle_bits: u32,
    /// Handle tables have `1 << hash_order` buckets.
    pub hash_order: u32,
    /// Maximum number of buffers per batch.
    pub max_bufs: u32,
    /// Validations after which a client assumes its buffers may have moved.
    pub clean_threshold: u32,
}

impl Default for Params {
    fn default() -> Self {
        let policy = WaitPolicy::default();
        Params {
            debug_flags: 0,
            fence_timeout: policy.slice,
            fence_retries: policy.retries,
            handle_bits: 24,
            hash_order: 10,
            max_bufs: crate::uapi::DRM_TTM_MAX_BUFS,
            clean_threshold: 1 << 30,
        }
    }
}

impl Params {
    /// Returns the fence wait policy these parameters describe.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            slice: self.fence_timeout,
            retries: self.fence_retries,
        }
    }
}

/// Memory-manager state, alive between `MM_INIT` and `MM_TAKEDOWN`.
pub struct MmState {
    aperture: Arc<Aperture>,
    sarea: Arc<Sarea>,
    sarea_handle: u32,
    vram: (u64, u64),
    handle_bits: u32,
    ttms: Mutex<HashTable<Arc<Ttm>>>,
    regions: Mutex<HashTable<Arc<Region>>>,
    handle_seed: AtomicU64,
}

crate::no_debug!(MmState);

impl MmState {
    /// Returns the aperture manager.
    pub fn aperture(&self) -> &Arc<Aperture> {
        &self.aperture
    }

    /// Returns the shared area.
    pub fn sarea(&self) -> &Arc<Sarea> {
        &self.sarea
    }

    /// Returns the shared area handle handed to clients.
    pub fn sarea_handle(&self) -> u32 {
        self.sarea_handle
    }

    /// Returns the VRAM range recorded at init. VRAM is not managed.
    pub fn vram(&self) -> (u64, u64) {
        self.vram
    }

    fn mint<T>(&self, table: &Mutex<HashTable<T>>, value: T) -> Result<u32> {
        let seed = self.handle_seed.fetch_add(1, Ordering::Relaxed);
        let key = table
            .lock()
            .insert_with_free_key(value, seed, self.handle_bits, 0, 1)
            .map_err(|(e, _)| e)?;
        u32::try_from(key).map_err(|_| TtmError::KeySpaceExhausted)
    }

    /// Publishes a TTM and returns its handle.
    pub(crate) fn add_ttm(&self, ttm: Arc<Ttm>) -> Result<u32> {
        let handle = self.mint(&self.ttms, ttm.clone())?;
        ttm.set_handle(handle);
        Ok(handle)
    }

    /// Looks up a TTM. Destroyed TTMs are dropped from the table on sight.
    pub(crate) fn lookup_ttm(&self, handle: u32) -> Result<Arc<Ttm>> {
        let mut ttms = self.ttms.lock();
        let ttm = ttms.find(handle as u64).cloned().ok_or(TtmError::NotFound)?;
        if ttm.is_destroyed() {
            ttms.remove_key(handle as u64)?;
            return Err(TtmError::NotFound);
        }
        Ok(ttm)
    }

    pub(crate) fn remove_ttm(&self, handle: u32) -> Result<Arc<Ttm>> {
        self.ttms.lock().remove_key(handle as u64)
    }

    /// Publishes a region and returns its handle.
    pub(crate) fn add_region(&self, region: Arc<Region>) -> Result<u32> {
        let handle = self.mint(&self.regions, region.clone())?;
        region.set_handle(handle);
        Ok(handle)
    }

    /// Looks up a region. Destroyed regions are dropped from the table on sight.
    pub(crate) fn lookup_region(&self, handle: u32) -> Result<Arc<Region>> {
        let mut regions = self.regions.lock();
        let region = regions
            .find(handle as u64)
            .cloned()
            .ok_or(TtmError::NotFound)?;
        if region.state() == RegionState::Destroyed {
            regions.remove_key(handle as u64)?;
            return Err(TtmError::NotFound);
        }
        Ok(region)
    }

    pub(crate) fn remove_region(&self, handle: u32) -> Result<Arc<Region>> {
        self.regions.lock().remove_key(handle as u64)
    }

    /// Returns the number of published regions and TTMs.
    pub fn handle_counts(&self) -> (usize, usize) {
        (self.regions.lock().fill(), self.ttms.lock().fill())
    }
}

/// A TTM-capable DRM device.
pub struct TtmDevice {
    cfg: &'static HwConfig,
    params: Params,
    fence: Arc<dyn FenceDriver>,
    backend: Arc<dyn BackendFactory>,
    /// Serializes batch processing and memory-manager setup/teardown.
    pub(crate) struct_sem: Mutex<()>,
    mm: Mutex<Option<Arc<MmState>>>,
    next_file_id: AtomicU64,
}

crate::no_debug!(TtmDevice);

impl TtmDevice {
    /// Creates a device for a chip with the given fence engine and aperture backend.
    pub fn new(
        cfg: &'static HwConfig,
        params: Params,
        fence: Arc<dyn FenceDriver>,
        backend: Arc<dyn BackendFactory>,
    ) -> Result<Arc<TtmDevice>> {
        debug::update_debug_flags(params.debug_flags);

        if params.handle_bits == 0 || params.handle_bits > 31 {
            return Err(TtmError::InvalidArgument("handle_bits"));
        }
        if params.max_bufs == 0 || params.fence_retries == 0 {
            return Err(TtmError::InvalidArgument("params"));
        }
        if fence.fence_types() as usize > MAX_FENCE_TYPES {
            return Err(TtmError::InvalidArgument("too many fence types"));
        }

        log::info!(
            "{}: chip {:#x}, {} fence types, {} GART pages",
            cfg.name,
            cfg.chip_id,
            fence.fence_types(),
            backend.aperture_pages()
        );
        Ok(Arc::new(TtmDevice {
            cfg,
            params,
            fence,
            backend,
            struct_sem: Mutex::new(()),
            mm: Mutex::new(None),
            next_file_id: AtomicU64::new(1),
        }))
    }

    /// Creates a device backed by the software fence engine and a GART sized from the chip
    /// configuration. Returns the models so callers can drive the "hardware".
    pub fn with_soft_hw(
        cfg: &'static HwConfig,
        params: Params,
    ) -> Result<(Arc<TtmDevice>, Arc<SoftFence>, Arc<Gart>)> {
        let fence = Arc::new(SoftFence::new(cfg.fence_types, cfg.kernel_emits_fences));
        let gart = Gart::new(cfg.gart_pages)?;
        let dev = TtmDevice::new(
            cfg,
            params,
            fence.clone(),
            Arc::new(AgpBackendFactory::new(gart.clone())),
        )?;
        Ok((dev, fence, gart))
    }

    /// Returns the device name used to tag log messages.
    pub fn name(&self) -> &'static str {
        self.cfg.name
    }

    /// Returns the chip configuration.
    pub fn config(&self) -> &'static HwConfig {
        self.cfg
    }

    /// Returns the device parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the fence engine.
    pub fn fence(&self) -> &Arc<dyn FenceDriver> {
        &self.fence
    }

    pub(crate) fn next_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sets up the memory manager over TT aperture pages `[tt_offset, tt_offset + tt_size)` and
    /// returns the SAREA handle.
    pub fn mm_init(
        &self,
        vram_offset: u64,
        vram_size: u64,
        tt_offset: u64,
        tt_size: u64,
    ) -> Result<u32> {
        let _sem = self.struct_sem.lock();
        let mut mm = self.mm.lock();
        if mm.is_some() {
            mod_dev_dbg!(self, "TtmDevice: memory manager already initialized");
            return Err(TtmError::Busy);
        }
        if tt_size == 0 {
            return Err(TtmError::InvalidArgument("empty tt range"));
        }

        let sarea = Arc::new(Sarea::new());
        let aperture = Aperture::new(
            tt_offset,
            tt_size,
            self.fence.clone(),
            self.backend.clone(),
            sarea.clone(),
            self.params.wait_policy(),
        )?;

        *mm = Some(Arc::new(MmState {
            aperture,
            sarea,
            sarea_handle: SAREA_HANDLE,
            vram: (vram_offset, vram_size),
            handle_bits: self.params.handle_bits,
            ttms: Mutex::new(HashTable::new(self.params.hash_order)?),
            regions: Mutex::new(HashTable::new(self.params.hash_order)?),
            handle_seed: AtomicU64::new(0),
        }));

        mod_dev_dbg!(
            self,
            "TtmDevice: mm init, tt pages [{:#x}, {:#x}), vram {:#x}+{:#x}",
            tt_offset,
            tt_offset + tt_size,
            vram_offset,
            vram_size
        );
        Ok(SAREA_HANDLE)
    }

    /// Tears the memory manager down.
    ///
    /// Every region is destroyed, then every TTM; TTMs still mapped are destroyed when their last
    /// mapping goes away. If a region cannot be destroyed (interrupted fence wait) the remaining
    /// regions are put back and the memory manager stays up.
    pub fn mm_takedown(&self) -> Result {
        let _sem = self.struct_sem.lock();
        let state = self.mm.lock().clone().ok_or(TtmError::NoDevice)?;

        let regions = state.regions.lock().drain();
        let mut pending = regions.into_iter();
        while let Some((key, region)) = pending.next() {
            if let Err(e) = region.destroy() {
                log::warn!(
                    "{}: takedown: region {:#x} not destroyed: {}",
                    self.name(),
                    key,
                    e
                );
                let mut table = state.regions.lock();
                for (key, region) in core::iter::once((key, region)).chain(pending) {
                    table.insert(key, region)?;
                }
                return Err(e);
            }
        }

        for (key, ttm) in state.ttms.lock().drain() {
            match ttm.destroy() {
                Ok(()) => {}
                Err(TtmError::Busy) => {
                    mod_dev_dbg!(self, "TtmDevice: takedown: ttm {:#x} still mapped", key);
                }
                Err(e) => log::warn!("{}: takedown: ttm {:#x}: {}", self.name(), key, e),
            }
        }

        if !state.aperture.is_clean() {
            log::warn!("{}: takedown: aperture not clean", self.name());
        }
        *self.mm.lock() = None;

        mod_dev_dbg!(self, "TtmDevice: mm takedown");
        Ok(())
    }

    /// Returns the memory-manager state.
    pub fn mm_state(&self) -> Result<Arc<MmState>> {
        self.mm.lock().clone().ok_or(TtmError::NoDevice)
    }

    /// Maps the shared area by handle.
    pub fn sarea(&self, handle: u32) -> Result<Arc<Sarea>> {
        let state = self.mm_state()?;
        if handle != state.sarea_handle {
            return Err(TtmError::NotFound);
        }
        Ok(state.sarea.clone())
    }

    /// Returns the handle of the shared area.
    pub fn sarea_handle(&self) -> Result<u32> {
        Ok(self.mm_state()?.sarea_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw;
    use crate::mem::PAGE_SIZE;

    fn device() -> (Arc<TtmDevice>, Arc<SoftFence>, Arc<Gart>) {
        TtmDevice::with_soft_hw(hw::I915, Params::default()).unwrap()
    }

    #[test]
    fn params_checked() {
        let params = Params {
            handle_bits: 32,
            ..Default::default()
        };
        assert!(TtmDevice::with_soft_hw(hw::I915, params).is_err());
        assert_eq!(Params::default().wait_policy(), WaitPolicy::default());
    }

    #[test]
    fn init_once() {
        let (dev, _, _) = device();
        assert_eq!(dev.mm_state().unwrap_err(), TtmError::NoDevice);
        assert_eq!(dev.mm_takedown(), Err(TtmError::NoDevice));

        let handle = dev.mm_init(0, 0, 0, 256).unwrap();
        assert_eq!(dev.mm_init(0, 0, 0, 256), Err(TtmError::Busy));
        assert!(dev.sarea(handle).is_ok());
        assert_eq!(dev.sarea(handle + 1).unwrap_err(), TtmError::NotFound);
        assert_eq!(dev.sarea_handle(), Ok(handle));

        dev.mm_takedown().unwrap();
        assert_eq!(dev.sarea(handle).unwrap_err(), TtmError::NoDevice);
        dev.mm_init(0, 0, 16, 16).unwrap();
    }

    #[test]
    fn init_range_checked() {
        let (dev, _, gart) = device();
        assert!(dev.mm_init(0, 0, gart.num_pages() - 4, 8).is_err());
        assert!(dev.mm_init(0, 0, 0, 0).is_err());
        dev.mm_init(0, 0, gart.num_pages() - 8, 8).unwrap();
    }

    #[test]
    fn handles_never_zero() {
        let (dev, _, _) = device();
        dev.mm_init(0, 0, 0, 64).unwrap();
        let mm = dev.mm_state().unwrap();
        let handles: Vec<u32> = (0..32)
            .map(|_| {
                mm.add_ttm(Ttm::create(PAGE_SIZE as u64, 1).unwrap())
                    .unwrap()
            })
            .collect();
        assert!(handles.iter().all(|h| *h != 0 && *h <= 1 << 24));
        let ttm = mm.lookup_ttm(handles[3]).unwrap();
        assert_eq!(ttm.handle(), handles[3]);

        ttm.destroy().unwrap();
        assert_eq!(mm.lookup_ttm(handles[3]).unwrap_err(), TtmError::NotFound);
        assert_eq!(mm.handle_counts(), (0, 31));
    }

    #[test]
    fn takedown_releases_everything() {
        let (dev, fence, gart) = device();
        dev.mm_init(0, 0, 0, 16).unwrap();
        let mm = dev.mm_state().unwrap();

        let ttm = Ttm::create(8 * PAGE_SIZE as u64, 1).unwrap();
        mm.add_ttm(ttm.clone()).unwrap();
        let mapped = Ttm::create(PAGE_SIZE as u64, 1).unwrap();
        mm.add_ttm(mapped.clone()).unwrap();
        let vma = mapped.map().unwrap();

        let region = Region::create(mm.aperture(), &ttm, 0, 8, false).unwrap();
        mm.add_region(region.clone()).unwrap();
        region.validate(0).unwrap();
        mm.aperture().fence_regions(&[region.clone()]).unwrap();
        fence.retire_all();
        assert_eq!(gart.bound_pages(), 8);

        dev.mm_takedown().unwrap();
        assert_eq!(region.state(), RegionState::Destroyed);
        assert!(ttm.is_destroyed());
        assert!(mapped.destroy_pending());
        assert_eq!(gart.bound_pages(), 0);

        drop(vma);
        assert!(mapped.is_destroyed());
    }

    #[test]
    fn interrupted_takedown_keeps_state() {
        let (dev, fence, _) = device();
        dev.mm_init(0, 0, 0, 16).unwrap();
        let mm = dev.mm_state().unwrap();
        let ttm = Ttm::create(4 * PAGE_SIZE as u64, 1).unwrap();
        let region = Region::create(mm.aperture(), &ttm, 0, 4, true).unwrap();
        let handle = mm.add_region(region.clone()).unwrap();
        region.validate(0).unwrap();
        mm.aperture().fence_regions(&[region.clone()]).unwrap();

        fence.interrupt();
        assert_eq!(dev.mm_takedown(), Err(TtmError::Interrupted));
        assert!(Arc::ptr_eq(&mm.lookup_region(handle).unwrap(), &region));
        assert_eq!(region.state(), RegionState::Bound);

        fence.retire_all();
        dev.mm_takedown().unwrap();
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! File implementation, which represents a single DRM client.
//!
//! This is in charge of the resources one client created (TTM objects and regions), of the
//! ownership checks on every handle the client passes in, and of the ioctl entry points:
//! memory-manager setup, TTM create/destroy, the buffer batch and fence operations.

use crate::debug::*;
use crate::driver::{MmState, TtmDevice};
use crate::error::{Result, TtmError};
use crate::mem::AddressSpace;
use crate::object::{Ttm, Vma};
use crate::region::Region;
use crate::uapi;

use core::mem::size_of;
use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::{FromBytes, IntoBytes};

const DEBUG_CLASS: DebugFlags = DebugFlags::File;

/// State associated with a client.
pub struct File {
    id: u64,
    dev: Arc<TtmDevice>,
    aspace: Arc<AddressSpace>,
    ttms: Mutex<Vec<u32>>,
    regions: Mutex<Vec<u32>>,
}

crate::no_debug!(File);

impl File {
    /// Opens the device for a client living in `aspace`.
    pub fn open(dev: &Arc<TtmDevice>, aspace: Arc<AddressSpace>) -> File {
        let id = dev.next_file_id();
        mod_dev_dbg!(dev, "[File {}]: DRM device opened", id);
        File {
            id,
            dev: dev.clone(),
            aspace,
            ttms: Mutex::new(Vec::new()),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Returns the client id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the device.
    pub fn device(&self) -> &Arc<TtmDevice> {
        &self.dev
    }

    /// Returns the client address space.
    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    fn lookup_ttm(&self, mm: &MmState, handle: u32) -> Result<Arc<Ttm>> {
        let ttm = mm.lookup_ttm(handle)?;
        if ttm.owner() != self.id {
            mod_dev_dbg!(self.dev, "[File {}]: ttm {:#x} not ours", self.id, handle);
            return Err(TtmError::PermissionDenied);
        }
        Ok(ttm)
    }

    fn lookup_region(&self, mm: &MmState, handle: u32) -> Result<Arc<Region>> {
        let region = mm.lookup_region(handle)?;
        if region.owner_file() != self.id {
            mod_dev_dbg!(self.dev, "[File {}]: region {:#x} not ours", self.id, handle);
            return Err(TtmError::PermissionDenied);
        }
        Ok(region)
    }

    /// Creates a CPU mapping of one of this client's TTMs.
    pub fn map_ttm(&self, handle: u32) -> Result<Vma> {
        let mm = self.dev.mm_state()?;
        self.lookup_ttm(&mm, handle)?.map()
    }

    /// Returns one of this client's regions.
    pub fn region(&self, handle: u32) -> Result<Arc<Region>> {
        let mm = self.dev.mm_state()?;
        self.lookup_region(&mm, handle)
    }

    /// IOCTL: mm_init: Set up or tear down the memory manager.
    pub fn mm_init(&self, data: &mut uapi::drm_mm_init_arg) -> Result<u32> {
        mod_dev_dbg!(self.dev, "[File {}]: IOCTL: mm_init op={}", self.id, data.op);

        match data.op {
            uapi::DRM_MM_INIT => {
                data.sarea_handle = self.dev.mm_init(
                    data.vram_offset,
                    data.vram_size,
                    data.tt_p_offset,
                    data.tt_p_size,
                )?;
                Ok(0)
            }
            uapi::DRM_MM_TAKEDOWN => {
                self.dev.mm_takedown()?;
                Ok(0)
            }
            _ => Err(TtmError::InvalidArgument("mm_init op")),
        }
    }

    /// IOCTL: ttm: Create or destroy a TTM object.
    pub fn ttm(&self, data: &mut uapi::drm_ttm_arg) -> Result<u32> {
        mod_dev_dbg!(
            self.dev,
            "[File {}]: IOCTL: ttm op={} handle={:#x} size={:#x}",
            self.id,
            data.op,
            data.handle,
            data.size
        );
        let mm = self.dev.mm_state()?;

        match data.op {
            uapi::DRM_TTM_ADD => {
                let ttm = Ttm::create(data.size, self.id)?;
                let mut ttms = self.ttms.lock();
                ttms.try_reserve(1)?;
                data.handle = mm.add_ttm(ttm.clone())?;
                data.num_pages = ttm.num_pages() as u64;
                ttms.push(data.handle);
                Ok(0)
            }
            uapi::DRM_TTM_REMOVE => {
                let _sem = self.dev.struct_sem.lock();
                let ttm = self.lookup_ttm(&mm, data.handle)?;
                // Busy leaves the handle in place: the object goes away with its last mapping.
                ttm.destroy()?;
                mm.remove_ttm(data.handle)?;
                self.ttms.lock().retain(|h| *h != data.handle);
                Ok(0)
            }
            _ => Err(TtmError::InvalidArgument("ttm op")),
        }
    }

    fn create_region(&self, mm: &MmState, buf: &uapi::drm_ttm_buf_arg) -> Result<Arc<Region>> {
        let cached = buf.flags & uapi::DRM_TTM_FLAG_CACHED != 0;
        let uncached = buf.flags & uapi::DRM_TTM_FLAG_UNCACHED != 0;
        if uncached && (cached || buf.flags & uapi::DRM_TTM_FLAG_USER != 0) {
            return Err(TtmError::InvalidArgument("caching flags"));
        }

        if buf.flags & uapi::DRM_TTM_FLAG_USER != 0 {
            Region::create_user(
                mm.aperture(),
                &self.aspace,
                self.id,
                buf.user_addr,
                buf.user_size,
            )
        } else {
            let ttm = self.lookup_ttm(mm, buf.ttm_handle)?;
            let page_offset = usize::try_from(buf.ttm_page_offset)
                .map_err(|_| TtmError::InvalidArgument("page offset"))?;
            let num_pages = usize::try_from(buf.num_pages)
                .map_err(|_| TtmError::InvalidArgument("page count"))?;
            // Either flag overrides the chip default.
            let cached = cached || (!uncached && self.dev.config().cached_by_default);
            Region::create(mm.aperture(), &ttm, page_offset, num_pages, cached)
        }
    }

    fn publish_region(&self, mm: &MmState, region: &Arc<Region>) -> Result<u32> {
        let mut regions = self.regions.lock();
        let published = regions
            .try_reserve(1)
            .map_err(TtmError::from)
            .and_then(|_| mm.add_region(region.clone()));
        match published {
            Ok(handle) => {
                regions.push(handle);
                Ok(handle)
            }
            Err(e) => {
                drop(regions);
                if let Err(e) = region.destroy() {
                    log::warn!("{}: unpublished region leaked: {}", self.dev.name(), e);
                }
                Err(e)
            }
        }
    }

    /// Undoes the creation of a region whose first validation failed.
    fn discard_region(&self, mm: &MmState, buf: &mut uapi::drm_ttm_buf_arg, region: &Region) {
        if let Err(e) = region.destroy() {
            log::warn!(
                "{}: [File {}]: failed region {:#x} not destroyed: {}",
                self.dev.name(),
                self.id,
                buf.region_handle,
                e
            );
            return;
        }
        if let Err(e) = mm.remove_region(buf.region_handle) {
            mod_dev_dbg!(self.dev, "[File {}]: region {:#x}: {}", self.id, buf.region_handle, e);
        }
        self.regions.lock().retain(|h| *h != buf.region_handle);
        buf.region_handle = 0;
    }

    /// Executes one batch entry. Returns the region if it was validated.
    fn exec_buf(
        &self,
        mm: &MmState,
        buf: &mut uapi::drm_ttm_buf_arg,
    ) -> Result<Option<Arc<Region>>> {
        if buf.flags & !uapi::DRM_TTM_FLAG_MASK != 0 {
            return Err(TtmError::InvalidArgument("buffer flags"));
        }

        match buf.op {
            uapi::DRM_TTM_BUF_VALIDATE => {
                let new = buf.flags & uapi::DRM_TTM_FLAG_NEW != 0;
                let region = if new {
                    let region = self.create_region(mm, buf)?;
                    buf.region_handle = self.publish_region(mm, &region)?;
                    region
                } else {
                    self.lookup_region(mm, buf.region_handle)?
                };

                let pinned = buf.flags & uapi::DRM_TTM_FLAG_PINNED != 0;
                if region.pinned() != pinned {
                    region.set_pinned(pinned);
                }
                match region.validate(buf.fence_type) {
                    Ok(offset) => {
                        buf.aper_offset = offset;
                        Ok(Some(region))
                    }
                    Err(e) => {
                        if new {
                            self.discard_region(mm, buf, &region);
                        }
                        Err(e)
                    }
                }
            }
            uapi::DRM_TTM_BUF_UNBIND => {
                self.lookup_region(mm, buf.region_handle)?.unbind()?;
                Ok(None)
            }
            uapi::DRM_TTM_BUF_EVICT => {
                self.lookup_region(mm, buf.region_handle)?.evict()?;
                Ok(None)
            }
            uapi::DRM_TTM_BUF_DESTROY => {
                self.lookup_region(mm, buf.region_handle)?.destroy()?;
                mm.remove_region(buf.region_handle)?;
                self.regions.lock().retain(|h| *h != buf.region_handle);
                Ok(None)
            }
            _ => Err(TtmError::InvalidArgument("buffer op")),
        }
    }

    fn read_bufs(&self, data: &uapi::drm_ttm_bufs_arg) -> Result<Vec<uapi::drm_ttm_buf_arg>> {
        const STRIDE: usize = size_of::<uapi::drm_ttm_buf_arg>();
        let count = data.num_bufs as usize;

        let mut raw = Vec::new();
        raw.try_reserve_exact(STRIDE * count)?;
        raw.resize(STRIDE * count, 0u8);
        self.aspace.read(data.bufs_ptr, &mut raw)?;

        let mut bufs = Vec::new();
        bufs.try_reserve_exact(count)?;
        for chunk in raw.chunks_exact(STRIDE) {
            bufs.push(
                uapi::drm_ttm_buf_arg::read_from_bytes(chunk)
                    .map_err(|_| TtmError::InvalidBuffer)?,
            );
        }
        Ok(bufs)
    }

    /// IOCTL: ttm_bufs: Process a batch of buffer operations.
    ///
    /// Each entry gets its own result in `ret`; a failing entry does not stop the batch. The
    /// whole batch runs under the device's batch lock. With `DRM_TTM_BUFS_FENCE_AFTER`, every
    /// region validated by the batch is fenced once processing is done, with one fence per type.
    pub fn ttm_bufs(&self, data: &mut uapi::drm_ttm_bufs_arg) -> Result<u32> {
        mod_dev_dbg!(
            self.dev,
            "[File {}]: IOCTL: ttm_bufs op={} flags={:#x} count={}",
            self.id,
            data.op,
            data.flags,
            data.num_bufs
        );

        if data.flags & !uapi::DRM_TTM_BUFS_FLAG_MASK != 0 || data.pad != 0 {
            return Err(TtmError::InvalidArgument("batch flags"));
        }
        if data.num_bufs > self.dev.params().max_bufs {
            return Err(TtmError::InvalidArgument("batch too large"));
        }
        let mm = self.dev.mm_state()?;
        let mut bufs = self.read_bufs(data)?;

        let sem = self.dev.struct_sem.lock();
        let res = match data.op {
            uapi::DRM_TTM_BUFS_EXECUTE => self.execute(&mm, data.flags, &mut bufs),
            uapi::DRM_TTM_BUFS_FENCE => self.fence_bufs(&mm, &mut bufs),
            _ => Err(TtmError::InvalidArgument("batch op")),
        };
        drop(sem);

        self.aspace.write(data.bufs_ptr, bufs.as_slice().as_bytes())?;
        res.map(|_| 0)
    }

    fn execute(&self, mm: &MmState, flags: u32, bufs: &mut [uapi::drm_ttm_buf_arg]) -> Result {
        let periodic = flags & uapi::DRM_TTM_BUFS_PERIODIC_FENCE != 0;
        if periodic && !debug_enabled(DebugFlags::NoPeriodicFence) {
            match mm.aperture().fence_lru_periodic() {
                Ok(0) => {}
                Ok(n) => mod_dev_dbg!(self.dev, "[File {}]: periodic fence of {}", self.id, n),
                Err(e) => log::warn!("{}: periodic fence failed: {}", self.dev.name(), e),
            }
        }

        let mut validated = Vec::new();
        validated.try_reserve(bufs.len())?;
        for (i, buf) in bufs.iter_mut().enumerate() {
            buf.ret = match self.exec_buf(mm, buf) {
                Ok(region) => {
                    validated.extend(region);
                    0
                }
                Err(e) => {
                    mod_dev_dbg!(self.dev, "[File {}]: buffer {} failed: {}", self.id, i, e);
                    e.to_errno()
                }
            };
        }

        if !validated.is_empty() {
            mm.sarea().bump_validation();
            if flags & uapi::DRM_TTM_BUFS_FENCE_AFTER != 0 {
                mm.aperture().fence_regions(&validated)?;
            }
        }
        Ok(())
    }

    fn fence_bufs(&self, mm: &MmState, bufs: &mut [uapi::drm_ttm_buf_arg]) -> Result {
        let mut regions = Vec::new();
        regions.try_reserve(bufs.len())?;
        for buf in bufs.iter_mut() {
            buf.ret = match self.lookup_region(mm, buf.region_handle) {
                Ok(region) => {
                    regions.push(region);
                    0
                }
                Err(e) => e.to_errno(),
            };
        }
        mm.aperture().fence_regions(&regions)?;
        Ok(())
    }

    /// IOCTL: fence: Emit, wait for or test a fence.
    pub fn fence(&self, data: &mut uapi::drm_fence_arg) -> Result<u32> {
        let fence = self.dev.fence();
        if data.fence_type >= fence.fence_types() {
            return Err(TtmError::InvalidArgument("fence type"));
        }
        let sarea = self.dev.mm_state().ok().map(|mm| mm.sarea().clone());

        match data.op {
            uapi::DRM_FENCE_EMIT => {
                data.fence_seq = fence.emit(data.fence_type)?;
                if let Some(sarea) = sarea.as_ref() {
                    sarea.set_emitted(data.fence_type, data.fence_seq);
                }
                data.ret = 0;
            }
            uapi::DRM_FENCE_WAIT => {
                fence.wait(
                    data.fence_type,
                    data.fence_seq,
                    &self.dev.params().wait_policy(),
                )?;
                data.ret = 0;
            }
            uapi::DRM_FENCE_TEST => {
                data.ret = fence.test(data.fence_type, data.fence_seq)? as i32;
            }
            _ => return Err(TtmError::InvalidArgument("fence op")),
        }

        if let Some(sarea) = sarea.as_ref() {
            sarea.set_retired(data.fence_type, fence.retired(data.fence_type)?);
        }
        mod_dev_dbg!(
            self.dev,
            "[File {}]: IOCTL: fence op={} {}:{:#x} ret={}",
            self.id,
            data.op,
            data.fence_type,
            data.fence_seq,
            data.ret
        );
        Ok(0)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        mod_dev_dbg!(self.dev, "[File {}]: closing", self.id);
        let Ok(mm) = self.dev.mm_state() else {
            return;
        };
        let _sem = self.dev.struct_sem.lock();

        for handle in core::mem::take(&mut *self.regions.lock()) {
            let Ok(region) = self.lookup_region(&mm, handle) else {
                continue;
            };
            match region.destroy() {
                Ok(()) => {
                    if let Err(e) = mm.remove_region(handle) {
                        mod_dev_dbg!(self.dev, "[File {}]: region {:#x}: {}", self.id, handle, e);
                    }
                }
                Err(e) => log::warn!(
                    "{}: [File {}]: region {:#x} not destroyed: {}",
                    self.dev.name(),
                    self.id,
                    handle,
                    e
                ),
            }
        }

        for handle in core::mem::take(&mut *self.ttms.lock()) {
            let Ok(ttm) = self.lookup_ttm(&mm, handle) else {
                continue;
            };
            if let Err(e) = mm.remove_ttm(handle) {
                mod_dev_dbg!(self.dev, "[File {}]: ttm {:#x}: {}", self.id, handle, e);
            }
            match ttm.destroy() {
                Ok(()) => {}
                Err(TtmError::Busy) => {
                    mod_dev_dbg!(self.dev, "[File {}]: ttm {:#x} still mapped", self.id, handle);
                }
                Err(e) => log::warn!(
                    "{}: [File {}]: ttm {:#x} not destroyed: {}",
                    self.dev.name(),
                    self.id,
                    handle,
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agp::Gart;
    use crate::driver::Params;
    use crate::fence::SoftFence;
    use crate::hw;
    use crate::mem::PAGE_SIZE;
    use crate::object::PageFlags;
    use crate::region::RegionState;

    struct Setup {
        dev: Arc<TtmDevice>,
        fence: Arc<SoftFence>,
        gart: Arc<Gart>,
    }

    fn setup(tt_pages: u64) -> Setup {
        let (dev, fence, gart) = TtmDevice::with_soft_hw(hw::I915, Params::default()).unwrap();
        dev.mm_init(0, 0, 0, tt_pages).unwrap();
        Setup { dev, fence, gart }
    }

    fn open(s: &Setup) -> File {
        File::open(&s.dev, AddressSpace::new())
    }

    fn add_ttm(file: &File, pages: u64) -> u32 {
        let mut arg = uapi::drm_ttm_arg {
            op: uapi::DRM_TTM_ADD,
            size: pages * PAGE_SIZE as u64,
            ..Default::default()
        };
        file.ttm(&mut arg).unwrap();
        assert_eq!(arg.num_pages, pages);
        arg.handle
    }

    fn new_buf(ttm: u32, offset: u64, pages: u64) -> uapi::drm_ttm_buf_arg {
        uapi::drm_ttm_buf_arg {
            op: uapi::DRM_TTM_BUF_VALIDATE,
            flags: uapi::DRM_TTM_FLAG_NEW,
            ttm_handle: ttm,
            ttm_page_offset: offset,
            num_pages: pages,
            ..Default::default()
        }
    }

    fn run(file: &File, op: u32, flags: u32, bufs: &mut [uapi::drm_ttm_buf_arg]) -> Result<u32> {
        let aspace = file.address_space();
        let len = bufs.len() * size_of::<uapi::drm_ttm_buf_arg>();
        let ptr = aspace.map_anonymous(len.max(1)).unwrap();
        aspace.write(ptr, bufs.as_bytes()).unwrap();

        let mut arg = uapi::drm_ttm_bufs_arg {
            op,
            flags,
            num_bufs: bufs.len() as u32,
            pad: 0,
            bufs_ptr: ptr,
        };
        let res = file.ttm_bufs(&mut arg);
        aspace.read(ptr, bufs.as_mut_bytes()).unwrap();
        res
    }

    #[test]
    fn batch_reports_per_buffer() {
        let s = setup(64);
        let file = open(&s);
        let ttm = add_ttm(&file, 10);

        let mut bufs = [
            new_buf(ttm, 0, 4),
            new_buf(ttm, 4, 4),
            new_buf(ttm, 2, 4),
            new_buf(ttm + 1, 0, 1),
        ];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, 0);
        assert_eq!(bufs[1].ret, 0);
        assert_eq!(bufs[2].ret, -libc::EINVAL);
        assert_eq!(bufs[3].ret, -libc::ENOENT);
        assert_ne!(bufs[0].region_handle, 0);
        assert_ne!(bufs[0].aper_offset, bufs[1].aper_offset);
        assert_eq!(s.gart.bound_pages(), 8);

        let sarea = s.dev.sarea(s.dev.sarea_handle().unwrap()).unwrap();
        assert_eq!(sarea.snapshot().validation_seq, 1);
    }

    #[test]
    fn fence_after_batches_per_type() {
        let s = setup(64);
        let file = open(&s);
        let ttm = add_ttm(&file, 8);
        let mut bufs = [new_buf(ttm, 0, 4), new_buf(ttm, 4, 4)];
        run(
            &file,
            uapi::DRM_TTM_BUFS_EXECUTE,
            uapi::DRM_TTM_BUFS_FENCE_AFTER,
            &mut bufs,
        )
        .unwrap();
        assert_eq!(s.fence.emit_calls(0), 1);

        let a = file.region(bufs[0].region_handle).unwrap();
        let b = file.region(bufs[1].region_handle).unwrap();
        assert!(a.fence().is_some());
        assert_eq!(a.fence(), b.fence());

        // Re-fence through the fence op.
        for buf in bufs.iter_mut() {
            buf.flags = 0;
        }
        run(&file, uapi::DRM_TTM_BUFS_FENCE, 0, &mut bufs).unwrap();
        assert_eq!(s.fence.emit_calls(0), 2);
        assert_eq!(a.fence().unwrap().1 .0, 2);
    }

    #[test]
    fn unbind_evict_destroy_ops() {
        let s = setup(64);
        let file = open(&s);
        let ttm = add_ttm(&file, 4);
        let mut bufs = [new_buf(ttm, 0, 4)];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        let handle = bufs[0].region_handle;
        let offset = bufs[0].aper_offset;
        let region = file.region(handle).unwrap();

        let mut op = [uapi::drm_ttm_buf_arg {
            op: uapi::DRM_TTM_BUF_EVICT,
            region_handle: handle,
            ..Default::default()
        }];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].ret, 0);
        assert_eq!(region.state(), RegionState::Evicted);

        op[0].op = uapi::DRM_TTM_BUF_VALIDATE;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].aper_offset, offset);

        op[0].op = uapi::DRM_TTM_BUF_UNBIND;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(region.state(), RegionState::Unbound);
        assert_eq!(s.gart.bound_pages(), 0);

        op[0].op = uapi::DRM_TTM_BUF_DESTROY;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].ret, 0);
        assert_eq!(region.state(), RegionState::Destroyed);
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].ret, -libc::ENOENT);

        op[0].op = 7;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].ret, -libc::EINVAL);
    }

    #[test]
    fn failed_new_validation_rolls_back() {
        let s = setup(8);
        let file = open(&s);
        let ttm = add_ttm(&file, 16);
        let mm = s.dev.mm_state().unwrap();

        let mut a = [new_buf(ttm, 0, 8)];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut a).unwrap();
        assert_eq!(a[0].ret, 0);

        // A is unfenced, so there is no room for B.
        let mut b = [new_buf(ttm, 8, 8)];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut b).unwrap();
        assert_eq!(b[0].ret, -libc::ENOSPC);
        assert_eq!(b[0].region_handle, 0);
        assert_eq!(mm.handle_counts(), (1, 1));
        assert_eq!(*file.regions.lock(), vec![a[0].region_handle]);
        let ttm_obj = mm.lookup_ttm(ttm).unwrap();
        assert!(ttm_obj.page_flags()[8..]
            .iter()
            .all(|f| !f.contains(PageFlags::USED)));

        let mut fence = [uapi::drm_ttm_buf_arg {
            region_handle: a[0].region_handle,
            ..Default::default()
        }];
        run(&file, uapi::DRM_TTM_BUFS_FENCE, 0, &mut fence).unwrap();
        s.fence.retire_all();

        // The same request now goes through.
        let mut b = [new_buf(ttm, 8, 8)];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut b).unwrap();
        assert_eq!(b[0].ret, 0);
        assert_ne!(b[0].region_handle, 0);
        assert_eq!(
            file.region(a[0].region_handle).unwrap().state(),
            RegionState::Unbound
        );
    }

    #[test]
    fn caching_flags_override_chip_default() {
        let (dev, _, _) = TtmDevice::with_soft_hw(hw::RADEON_R200, Params::default()).unwrap();
        assert!(dev.config().cached_by_default);
        dev.mm_init(0, 0, 0, 64).unwrap();
        let file = File::open(&dev, AddressSpace::new());
        let ttm = add_ttm(&file, 8);
        let mm = dev.mm_state().unwrap();

        let mut bufs = [new_buf(ttm, 0, 2), new_buf(ttm, 2, 2), new_buf(ttm, 4, 2)];
        bufs[1].flags |= uapi::DRM_TTM_FLAG_UNCACHED;
        bufs[2].flags |= uapi::DRM_TTM_FLAG_UNCACHED | uapi::DRM_TTM_FLAG_CACHED;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, 0);
        assert_eq!(bufs[1].ret, 0);
        assert_eq!(bufs[2].ret, -libc::EINVAL);

        let flags = mm.lookup_ttm(ttm).unwrap().page_flags();
        assert!(!flags[0].contains(PageFlags::UNCACHED));
        assert!(flags[2].contains(PageFlags::UNCACHED));
        assert!(!flags[4].contains(PageFlags::USED));

        // Client memory is always cached.
        let addr = file.address_space().map_anonymous(PAGE_SIZE).unwrap();
        let mut user = [uapi::drm_ttm_buf_arg {
            op: uapi::DRM_TTM_BUF_VALIDATE,
            flags: uapi::DRM_TTM_FLAG_NEW | uapi::DRM_TTM_FLAG_USER | uapi::DRM_TTM_FLAG_UNCACHED,
            user_addr: addr,
            user_size: PAGE_SIZE as u64,
            ..Default::default()
        }];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut user).unwrap();
        assert_eq!(user[0].ret, -libc::EINVAL);
    }

    #[test]
    fn batch_limits() {
        let s = setup(64);
        let file = open(&s);
        let mut bufs = vec![uapi::drm_ttm_buf_arg::default(); 33];
        assert!(run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).is_err());
        assert!(run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 1 << 7, &mut bufs[..1]).is_err());

        let mut arg = uapi::drm_ttm_bufs_arg {
            num_bufs: 2,
            bufs_ptr: 0x1000,
            ..Default::default()
        };
        assert_eq!(file.ttm_bufs(&mut arg), Err(TtmError::InvalidBuffer));
    }

    #[test]
    fn ownership_enforced() {
        let s = setup(64);
        let a = open(&s);
        let b = open(&s);
        let ttm = add_ttm(&a, 4);
        let mut bufs = [new_buf(ttm, 0, 4)];
        run(&b, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, -libc::EPERM);

        run(&a, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, 0);
        let mut op = [uapi::drm_ttm_buf_arg {
            op: uapi::DRM_TTM_BUF_DESTROY,
            region_handle: bufs[0].region_handle,
            ..Default::default()
        }];
        run(&b, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut op).unwrap();
        assert_eq!(op[0].ret, -libc::EPERM);

        let mut rm = uapi::drm_ttm_arg {
            op: uapi::DRM_TTM_REMOVE,
            handle: ttm,
            ..Default::default()
        };
        assert_eq!(b.ttm(&mut rm), Err(TtmError::PermissionDenied));
        assert!(b.map_ttm(ttm).is_err());
    }

    #[test]
    fn user_regions() {
        let s = setup(64);
        let file = open(&s);
        let addr = file.address_space().map_anonymous(3 * PAGE_SIZE).unwrap();
        file.address_space().write(addr + 10, b"user").unwrap();

        let mut bufs = [uapi::drm_ttm_buf_arg {
            op: uapi::DRM_TTM_BUF_VALIDATE,
            flags: uapi::DRM_TTM_FLAG_NEW | uapi::DRM_TTM_FLAG_USER,
            user_addr: addr + 10,
            user_size: 2 * PAGE_SIZE as u64,
            ..Default::default()
        }];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, 0);
        let region = file.region(bufs[0].region_handle).unwrap();
        assert_eq!(region.num_pages(), 3);
        assert_eq!(region.user_addr(), Some(addr));

        let mut buf = [0u8; 4];
        s.gart.read(bufs[0].aper_offset, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"user");

        bufs[0].user_addr = 0x10;
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();
        assert_eq!(bufs[0].ret, -libc::EFAULT);

        drop(file);
        assert_eq!(region.state(), RegionState::Destroyed);
        assert_eq!(s.gart.bound_pages(), 0);
    }

    #[test]
    fn ttm_remove_deferred_while_mapped() {
        let s = setup(64);
        let file = open(&s);
        let handle = add_ttm(&file, 2);
        let vma = file.map_ttm(handle).unwrap();
        vma.fault(0).unwrap();

        let mut rm = uapi::drm_ttm_arg {
            op: uapi::DRM_TTM_REMOVE,
            handle,
            ..Default::default()
        };
        assert_eq!(file.ttm(&mut rm), Err(TtmError::Busy));
        assert!(vma.ttm().destroy_pending());
        drop(vma);
        assert_eq!(file.ttm(&mut rm), Err(TtmError::NotFound));
    }

    #[test]
    fn fence_ops() {
        let s = setup(16);
        let file = open(&s);
        let mut arg = uapi::drm_fence_arg {
            op: uapi::DRM_FENCE_EMIT,
            ..Default::default()
        };
        file.fence(&mut arg).unwrap();
        let seq = arg.fence_seq;
        let sarea = s.dev.sarea(s.dev.sarea_handle().unwrap()).unwrap();
        assert_eq!(sarea.emitted(0), Some(seq));

        arg.op = uapi::DRM_FENCE_TEST;
        file.fence(&mut arg).unwrap();
        assert_eq!(arg.ret, 0);

        s.fence.retire_all();
        arg.op = uapi::DRM_FENCE_WAIT;
        file.fence(&mut arg).unwrap();
        assert_eq!(sarea.retired(0), Some(seq));

        arg.fence_type = 3;
        assert!(file.fence(&mut arg).is_err());
    }

    #[test]
    fn close_and_takedown() {
        let s = setup(64);
        let file = open(&s);
        let ttm = add_ttm(&file, 4);
        let mut bufs = [new_buf(ttm, 0, 4)];
        run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs).unwrap();

        let mut arg = uapi::drm_mm_init_arg {
            op: uapi::DRM_MM_TAKEDOWN,
            ..Default::default()
        };
        file.mm_init(&mut arg).unwrap();
        assert_eq!(s.gart.bound_pages(), 0);
        assert_eq!(
            run(&file, uapi::DRM_TTM_BUFS_EXECUTE, 0, &mut bufs),
            Err(TtmError::NoDevice)
        );

        arg.op = uapi::DRM_MM_INIT;
        arg.tt_p_size = 32;
        file.mm_init(&mut arg).unwrap();
        assert_eq!(arg.sarea_handle, crate::sarea::SAREA_HANDLE);
        drop(file);
    }
}

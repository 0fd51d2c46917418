// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Client-side convenience layer
//!
//! Wraps the raw ioctls the way a userspace driver library would: buffers are described once in
//! a [`BufList`], validated and fenced as a batch, and fence waits or revalidation checks are
//! answered from the shared area when possible instead of entering the kernel.

use crate::debug::*;
use crate::driver::Params;
use crate::error::{Result, TtmError};
use crate::fence::FenceValue;
use crate::file::File;
use crate::sarea::Sarea;
use crate::uapi;

use core::mem::size_of;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zerocopy::IntoBytes;

const DEBUG_CLASS: DebugFlags = DebugFlags::Client;

/// When a validated buffer must be validated again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Validations by any client after which a buffer is assumed to have moved, even without an
    /// eviction being reported.
    pub clean_threshold: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy {
            clean_threshold: 1 << 30,
        }
    }
}

impl From<&Params> for ValidationPolicy {
    fn from(params: &Params) -> Self {
        ValidationPolicy {
            clean_threshold: params.clean_threshold,
        }
    }
}

/// What a buffer is made of.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufSource {
    /// Pages `[page_offset, page_offset + num_pages)` of a TTM.
    Ttm {
        handle: u32,
        page_offset: u64,
        num_pages: u64,
    },
    /// Client memory.
    User { addr: u64, size: u64 },
}

/// A buffer as seen by the client.
#[derive(Clone, Debug)]
pub struct Buffer {
    source: BufSource,
    flags: u32,
    fence_type: u32,
    region_handle: u32,
    aper_offset: Option<u64>,
    validation_seq: u32,
    evict_tt_seq: u32,
    error: Option<TtmError>,
}

impl Buffer {
    /// Returns the region handle, or 0 before the first validation.
    pub fn region_handle(&self) -> u32 {
        self.region_handle
    }

    /// Returns the aperture page offset of the last successful validation.
    pub fn aper_offset(&self) -> Option<u64> {
        self.aper_offset
    }

    /// Returns the error of the last operation on this buffer.
    pub fn error(&self) -> Option<TtmError> {
        self.error
    }

    /// Returns the fence type the buffer is validated for.
    pub fn fence_type(&self) -> u32 {
        self.fence_type
    }

    fn to_arg(&self, op: u32) -> uapi::drm_ttm_buf_arg {
        let mut arg = uapi::drm_ttm_buf_arg {
            op,
            flags: self.flags,
            region_handle: self.region_handle,
            fence_type: self.fence_type,
            ..Default::default()
        };
        if self.region_handle == 0 {
            arg.flags |= uapi::DRM_TTM_FLAG_NEW;
            match self.source {
                BufSource::Ttm {
                    handle,
                    page_offset,
                    num_pages,
                } => {
                    arg.ttm_handle = handle;
                    arg.ttm_page_offset = page_offset;
                    arg.num_pages = num_pages;
                }
                BufSource::User { addr, size } => {
                    arg.flags |= uapi::DRM_TTM_FLAG_USER;
                    arg.user_addr = addr;
                    arg.user_size = size;
                }
            }
        }
        arg
    }
}

/// An ordered list of buffers submitted together.
#[derive(Clone, Debug, Default)]
pub struct BufList {
    bufs: Vec<Buffer>,
}

impl BufList {
    /// Creates an empty list.
    pub fn new() -> BufList {
        BufList::default()
    }

    fn push(&mut self, source: BufSource, flags: u32, fence_type: u32) -> Result<usize> {
        const ALLOWED: u32 =
            uapi::DRM_TTM_FLAG_CACHED | uapi::DRM_TTM_FLAG_UNCACHED | uapi::DRM_TTM_FLAG_PINNED;
        if flags & !ALLOWED != 0 {
            return Err(TtmError::InvalidArgument("buffer flags"));
        }
        self.bufs.try_reserve(1)?;
        self.bufs.push(Buffer {
            source,
            flags,
            fence_type,
            region_handle: 0,
            aper_offset: None,
            validation_seq: 0,
            evict_tt_seq: 0,
            error: None,
        });
        Ok(self.bufs.len() - 1)
    }

    /// Adds a buffer over pages of a TTM. Returns its index.
    pub fn add_ttm_buf(
        &mut self,
        ttm_handle: u32,
        page_offset: u64,
        num_pages: u64,
        flags: u32,
        fence_type: u32,
    ) -> Result<usize> {
        self.push(
            BufSource::Ttm {
                handle: ttm_handle,
                page_offset,
                num_pages,
            },
            flags,
            fence_type,
        )
    }

    /// Adds a buffer over client memory. Returns its index.
    pub fn add_user_buf(&mut self, addr: u64, size: u64, flags: u32, fence_type: u32) -> Result<usize> {
        self.push(BufSource::User { addr, size }, flags, fence_type)
    }

    /// Returns a buffer by index.
    pub fn get(&self, index: usize) -> Option<&Buffer> {
        self.bufs.get(index)
    }

    /// Returns the number of buffers.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Iterates over the buffers.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.bufs.iter()
    }
}

/// A memory-manager client session.
pub struct MmClient {
    file: File,
    sarea: Arc<Sarea>,
    policy: ValidationPolicy,
    scratch: u64,
    max_bufs: usize,
    ioctls: AtomicU64,
}

crate::no_debug!(MmClient);

impl MmClient {
    /// Initializes the memory manager through `file` and opens a session on it.
    pub fn init(file: File, vram: (u64, u64), tt_offset: u64, tt_size: u64) -> Result<MmClient> {
        let mut arg = uapi::drm_mm_init_arg {
            op: uapi::DRM_MM_INIT,
            vram_offset: vram.0,
            vram_size: vram.1,
            tt_p_offset: tt_offset,
            tt_p_size: tt_size,
            ..Default::default()
        };
        file.mm_init(&mut arg)?;
        MmClient::attach(file)
    }

    /// Opens a session on an already initialized memory manager.
    pub fn attach(file: File) -> Result<MmClient> {
        let dev = file.device().clone();
        let sarea = dev.sarea(dev.sarea_handle()?)?;
        let max_bufs = dev.params().max_bufs as usize;
        let scratch = file
            .address_space()
            .map_anonymous(max_bufs * size_of::<uapi::drm_ttm_buf_arg>())?;

        mod_dev_dbg!(dev, "MmClient: file {} attached", file.id());
        Ok(MmClient {
            file,
            sarea,
            policy: ValidationPolicy::from(dev.params()),
            scratch,
            max_bufs,
            ioctls: AtomicU64::new(0),
        })
    }

    /// Takes the memory manager down.
    pub fn takedown(self) -> Result {
        let mut arg = uapi::drm_mm_init_arg {
            op: uapi::DRM_MM_TAKEDOWN,
            ..Default::default()
        };
        self.ioctl(|f| f.mm_init(&mut arg))?;
        Ok(())
    }

    /// Returns the underlying file.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the shared area.
    pub fn sarea(&self) -> &Arc<Sarea> {
        &self.sarea
    }

    /// Returns the revalidation policy.
    pub fn policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Replaces the revalidation policy.
    pub fn set_policy(&mut self, policy: ValidationPolicy) {
        self.policy = policy;
    }

    /// Returns how many ioctls this session issued.
    pub fn ioctl_count(&self) -> u64 {
        self.ioctls.load(Ordering::Relaxed)
    }

    fn ioctl<T>(&self, cb: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        self.ioctls.fetch_add(1, Ordering::Relaxed);
        cb(&self.file)
    }

    /// Creates a TTM of `size` bytes. Returns its handle and size in pages.
    pub fn ttm_create(&self, size: u64) -> Result<(u32, u64)> {
        let mut arg = uapi::drm_ttm_arg {
            op: uapi::DRM_TTM_ADD,
            size,
            ..Default::default()
        };
        self.ioctl(|f| f.ttm(&mut arg))?;
        Ok((arg.handle, arg.num_pages))
    }

    /// Destroys a TTM. Fails with `Busy` while it is mapped; it then goes away on last unmap.
    pub fn ttm_destroy(&self, handle: u32) -> Result {
        let mut arg = uapi::drm_ttm_arg {
            op: uapi::DRM_TTM_REMOVE,
            handle,
            ..Default::default()
        };
        self.ioctl(|f| f.ttm(&mut arg))?;
        Ok(())
    }

    /// Runs one batch through the scratch buffer and returns the entries as the kernel left them.
    fn submit(
        &self,
        op: u32,
        flags: u32,
        args: &[uapi::drm_ttm_buf_arg],
    ) -> Result<Vec<uapi::drm_ttm_buf_arg>> {
        if args.len() > self.max_bufs {
            return Err(TtmError::InvalidArgument("batch too large"));
        }
        let aspace = self.file.address_space();
        aspace.write(self.scratch, args.as_bytes())?;

        let mut arg = uapi::drm_ttm_bufs_arg {
            op,
            flags,
            num_bufs: args.len() as u32,
            pad: 0,
            bufs_ptr: self.scratch,
        };
        self.ioctl(|f| f.ttm_bufs(&mut arg))?;

        let mut out = args.to_vec();
        aspace.read(self.scratch, out.as_mut_slice().as_mut_bytes())?;
        Ok(out)
    }

    /// Returns true if a buffer may have moved since it was last validated.
    pub fn check_validation(&self, buf: &Buffer) -> bool {
        if buf.aper_offset.is_none() {
            return true;
        }
        let snap = self.sarea.snapshot();
        snap.evict_tt_seq != buf.evict_tt_seq
            || snap.validation_seq.wrapping_sub(buf.validation_seq) >= self.policy.clean_threshold
    }

    /// Validates a list of buffers, creating their regions first where needed.
    ///
    /// Without `fence_after`, buffers still known to be resident are skipped. With it, every
    /// buffer is submitted and the kernel fences them all once the batch is done. Per-buffer
    /// failures are recorded on the buffers; the first one is returned.
    pub fn validate_list(&self, list: &mut BufList, fence_after: bool) -> Result {
        let indices: Vec<usize> = (0..list.len())
            .filter(|i| fence_after || self.check_validation(&list.bufs[*i]))
            .collect();
        if indices.is_empty() {
            mod_pr_debug!("MmClient: all {} buffers still valid", list.len());
            return Ok(());
        }

        let args: Vec<uapi::drm_ttm_buf_arg> = indices
            .iter()
            .map(|i| list.bufs[*i].to_arg(uapi::DRM_TTM_BUF_VALIDATE))
            .collect();
        let flags = if fence_after {
            uapi::DRM_TTM_BUFS_FENCE_AFTER
        } else {
            0
        };
        let out = self.submit(uapi::DRM_TTM_BUFS_EXECUTE, flags, &args)?;

        let snap = self.sarea.snapshot();
        let mut first_err = None;
        for (i, res) in indices.into_iter().zip(out.iter()) {
            let buf = &mut list.bufs[i];
            buf.error = TtmError::from_errno(res.ret);
            match buf.error {
                None => {
                    buf.region_handle = res.region_handle;
                    buf.aper_offset = Some(res.aper_offset);
                    buf.validation_seq = snap.validation_seq;
                    buf.evict_tt_seq = snap.evict_tt_seq;
                }
                Some(e) => {
                    buf.aper_offset = None;
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Fences every created buffer of the list with one fence per fence type.
    pub fn fence_list(&self, list: &mut BufList) -> Result {
        let indices: Vec<usize> = (0..list.len())
            .filter(|i| list.bufs[*i].region_handle != 0)
            .collect();
        if indices.is_empty() {
            return Ok(());
        }
        let args: Vec<uapi::drm_ttm_buf_arg> = indices
            .iter()
            .map(|i| list.bufs[*i].to_arg(uapi::DRM_TTM_BUF_VALIDATE))
            .collect();
        let out = self.submit(uapi::DRM_TTM_BUFS_FENCE, 0, &args)?;

        let mut first_err = None;
        for (i, res) in indices.into_iter().zip(out.iter()) {
            list.bufs[i].error = TtmError::from_errno(res.ret);
            if let Some(e) = list.bufs[i].error {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn buf_op(&self, buf: &mut Buffer, op: u32) -> Result {
        if buf.region_handle == 0 {
            return Err(TtmError::NotFound);
        }
        let out = self.submit(uapi::DRM_TTM_BUFS_EXECUTE, 0, &[buf.to_arg(op)])?;
        buf.error = out.first().and_then(|res| TtmError::from_errno(res.ret));
        match buf.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Waits until the buffer is idle, then releases its aperture space.
    pub fn unbind(&self, list: &mut BufList, index: usize) -> Result {
        let buf = list.bufs.get_mut(index).ok_or(TtmError::NotFound)?;
        self.buf_op(buf, uapi::DRM_TTM_BUF_UNBIND)?;
        buf.aper_offset = None;
        Ok(())
    }

    /// Waits until the buffer is idle, then unbinds it, keeping its aperture reservation.
    pub fn evict(&self, list: &mut BufList, index: usize) -> Result {
        let buf = list.bufs.get_mut(index).ok_or(TtmError::NotFound)?;
        self.buf_op(buf, uapi::DRM_TTM_BUF_EVICT)?;
        buf.aper_offset = None;
        Ok(())
    }

    /// Destroys the buffer's region. The buffer stays in the list and is recreated on the next
    /// validation.
    pub fn destroy(&self, list: &mut BufList, index: usize) -> Result {
        let buf = list.bufs.get_mut(index).ok_or(TtmError::NotFound)?;
        self.buf_op(buf, uapi::DRM_TTM_BUF_DESTROY)?;
        buf.region_handle = 0;
        buf.aper_offset = None;
        Ok(())
    }

    /// Emits a fence of the given type and returns its sequence number.
    pub fn fence_emit(&self, fence_type: u32) -> Result<u32> {
        let mut arg = uapi::drm_fence_arg {
            op: uapi::DRM_FENCE_EMIT,
            fence_type,
            ..Default::default()
        };
        self.ioctl(|f| f.fence(&mut arg))?;
        Ok(arg.fence_seq)
    }

    fn retired_in_sarea(&self, fence_type: u32, seq: u32) -> bool {
        self.sarea
            .retired(fence_type)
            .is_some_and(|retired| FenceValue(seq).passed(FenceValue(retired)))
    }

    /// Blocks until a fence retires. Returns at once if the shared area already shows it retired.
    pub fn fence_wait(&self, fence_type: u32, seq: u32) -> Result {
        if self.retired_in_sarea(fence_type, seq) {
            return Ok(());
        }
        let mut arg = uapi::drm_fence_arg {
            op: uapi::DRM_FENCE_WAIT,
            fence_type,
            fence_seq: seq,
            ret: 0,
        };
        self.ioctl(|f| f.fence(&mut arg))?;
        Ok(())
    }

    /// Returns true if a fence has retired, asking the kernel only if the shared area does not
    /// already show it.
    pub fn fence_test(&self, fence_type: u32, seq: u32) -> Result<bool> {
        if self.retired_in_sarea(fence_type, seq) {
            return Ok(true);
        }
        let mut arg = uapi::drm_fence_arg {
            op: uapi::DRM_FENCE_TEST,
            fence_type,
            fence_seq: seq,
            ret: 0,
        };
        self.ioctl(|f| f.fence(&mut arg))?;
        Ok(arg.ret != 0)
    }
}

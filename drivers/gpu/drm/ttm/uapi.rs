// SPDX-License-Identifier: GPL-2.0-only OR MIT
#![allow(non_camel_case_types)]

//! Client-visible ioctl argument structures.
//!
//! All structures are `#[repr(C)]`, padding-free and plain-old-data, so batches can be copied
//! in and out of client memory as raw bytes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum number of buffers in one `TTM_BUFS` batch.
pub const DRM_TTM_MAX_BUFS: u32 = 32;

/// `MM_INIT` operation: set up the memory manager.
pub const DRM_MM_INIT: u32 = 0;
/// `MM_INIT` operation: tear the memory manager down.
pub const DRM_MM_TAKEDOWN: u32 = 1;

/// Memory-manager setup arguments. Offsets and sizes of the TT range are in pages.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct drm_mm_init_arg {
    pub op: u32,
    /// Out: handle of the shared area.
    pub sarea_handle: u32,
    pub vram_offset: u64,
    pub vram_size: u64,
    pub tt_p_offset: u64,
    pub tt_p_size: u64,
}

/// `TTM` operation: create a TTM object.
pub const DRM_TTM_ADD: u32 = 0;
/// `TTM` operation: destroy a TTM object (deferred while mapped).
pub const DRM_TTM_REMOVE: u32 = 1;

/// TTM object create/destroy arguments.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct drm_ttm_arg {
    pub op: u32,
    /// In (remove) / out (add): object handle.
    pub handle: u32,
    /// In (add): size in bytes.
    pub size: u64,
    /// Out (add): size in pages.
    pub num_pages: u64,
}

/// Per-buffer op: make the region resident, creating it first if `DRM_TTM_FLAG_NEW` is set.
/// A region created this way that fails to become resident is destroyed again and
/// `region_handle` comes back as 0.
pub const DRM_TTM_BUF_VALIDATE: u32 = 0;
/// Per-buffer op: wait for idle, release the aperture space and unbind.
pub const DRM_TTM_BUF_UNBIND: u32 = 1;
/// Per-buffer op: wait for idle and unbind, keeping the aperture reservation.
pub const DRM_TTM_BUF_EVICT: u32 = 2;
/// Per-buffer op: destroy the region.
pub const DRM_TTM_BUF_DESTROY: u32 = 3;

/// Create a new region before validating it.
pub const DRM_TTM_FLAG_NEW: u32 = 1 << 0;
/// The new region wraps client memory at `user_addr` instead of TTM pages.
pub const DRM_TTM_FLAG_USER: u32 = 1 << 1;
/// The new region keeps normal CPU caching while bound, whatever the chip default.
pub const DRM_TTM_FLAG_CACHED: u32 = 1 << 2;
/// The region is never chosen for eviction.
pub const DRM_TTM_FLAG_PINNED: u32 = 1 << 3;
/// The new TTM region is mapped uncached while bound, whatever the chip default. Not valid
/// with `DRM_TTM_FLAG_CACHED` or `DRM_TTM_FLAG_USER`.
pub const DRM_TTM_FLAG_UNCACHED: u32 = 1 << 4;
/// All valid per-buffer flags.
pub const DRM_TTM_FLAG_MASK: u32 = DRM_TTM_FLAG_NEW
    | DRM_TTM_FLAG_USER
    | DRM_TTM_FLAG_CACHED
    | DRM_TTM_FLAG_PINNED
    | DRM_TTM_FLAG_UNCACHED;

/// One entry of a `TTM_BUFS` batch.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct drm_ttm_buf_arg {
    pub op: u32,
    pub flags: u32,
    pub ttm_handle: u32,
    /// In: region to operate on. Out: handle of a newly created region.
    pub region_handle: u32,
    pub ttm_page_offset: u64,
    pub num_pages: u64,
    pub user_addr: u64,
    pub user_size: u64,
    pub fence_type: u32,
    /// Out: 0 or a negative errno.
    pub ret: i32,
    /// Out: aperture page offset after validation.
    pub aper_offset: u64,
}

/// Batch op: execute the per-buffer ops.
pub const DRM_TTM_BUFS_EXECUTE: u32 = 0;
/// Batch op: fence every region named in the batch.
pub const DRM_TTM_BUFS_FENCE: u32 = 1;

/// Fence all successfully validated regions after executing the batch.
pub const DRM_TTM_BUFS_FENCE_AFTER: u32 = 1 << 0;
/// Run an opportunistic fencing pass over the LRU before executing the batch.
pub const DRM_TTM_BUFS_PERIODIC_FENCE: u32 = 1 << 1;
/// All valid batch flags.
pub const DRM_TTM_BUFS_FLAG_MASK: u32 = DRM_TTM_BUFS_FENCE_AFTER | DRM_TTM_BUFS_PERIODIC_FENCE;

/// `TTM_BUFS` batch header. `bufs_ptr` points at `num_bufs` `drm_ttm_buf_arg`s in client memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct drm_ttm_bufs_arg {
    pub op: u32,
    pub flags: u32,
    pub num_bufs: u32,
    pub pad: u32,
    pub bufs_ptr: u64,
}

/// Fence op: emit a new fence.
pub const DRM_FENCE_EMIT: u32 = 0;
/// Fence op: block until the fence retires.
pub const DRM_FENCE_WAIT: u32 = 1;
/// Fence op: poll the fence; `ret` is 1 if retired, 0 if not.
pub const DRM_FENCE_TEST: u32 = 2;

/// Fence emit/wait/test arguments.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct drm_fence_arg {
    pub op: u32,
    pub fence_type: u32,
    pub fence_seq: u32,
    pub ret: i32,
}

const _: () = assert!(core::mem::size_of::<drm_ttm_buf_arg>() == 64);

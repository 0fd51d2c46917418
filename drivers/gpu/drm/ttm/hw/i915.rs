// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware configuration for Intel i915G.

use super::*;

pub(crate) const HWCONFIG: super::HwConfig = HwConfig {
    name: "i915",
    chip_id: 0x2582,
    family: ChipFamily::Intel,
    // Single ring; breadcrumbs are written by MI_STORE_DWORD_INDEX.
    fence_types: 1,
    kernel_emits_fences: false,
    // 256MiB aperture
    gart_pages: 0x10000,
    cached_by_default: false,
};

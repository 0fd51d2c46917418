// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware configuration for Intel i830M.

use super::*;

pub(crate) const HWCONFIG: super::HwConfig = HwConfig {
    name: "i830",
    chip_id: 0x3577,
    family: ChipFamily::Intel,
    fence_types: 1,
    // Every batchbuffer emit writes a breadcrumb.
    kernel_emits_fences: true,
    // 128MiB aperture
    gart_pages: 0x8000,
    cached_by_default: false,
};

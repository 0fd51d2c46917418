// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware configuration for Matrox G400.

use super::*;

pub(crate) const HWCONFIG_G400: super::HwConfig = HwConfig {
    name: "mga-g400",
    chip_id: 0x0525,
    family: ChipFamily::Matrox,
    fence_types: 1,
    kernel_emits_fences: true,
    // 16MiB AGP window
    gart_pages: 0x1000,
    cached_by_default: false,
};

// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Hardware configuration for ATI Radeon R200 chips.

use super::*;

pub(crate) const HWCONFIG_R200: super::HwConfig = HwConfig {
    name: "r200",
    chip_id: 0x514c,
    family: ChipFamily::Radeon,
    // CP ring and 2D blit engine have separate scratch counters.
    fence_types: 2,
    kernel_emits_fences: false,
    // 32MiB PCI GART
    gart_pages: 0x2000,
    cached_by_default: true,
};

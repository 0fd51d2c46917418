// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Per-chip hardware configuration structures
//!
//! This module contains the static configuration tables for the chips the memory manager
//! drives. The values only describe what the memory manager needs to know: how many independent
//! fence counters the chip has, who emits fences, and how big the GART aperture is.

pub mod i830;
pub mod i915;
pub mod mga;
pub mod radeon;

/// Chip family. Note: reported to clients in debug output only.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u32)]
pub enum ChipFamily {
    Intel = 0,
    Radeon = 1,
    Matrox = 2,
}

/// Static hardware configuration for a given chip.
#[derive(Debug)]
pub struct HwConfig {
    /// Short chip name, used as the log target of the device.
    pub name: &'static str,
    /// PCI device ID.
    pub chip_id: u32,
    /// Chip family.
    pub family: ChipFamily,
    /// Number of independent fence sequence counters (engines).
    pub fence_types: u32,
    /// The command submission path emits a fence on every submission by itself.
    pub kernel_emits_fences: bool,
    /// Size of the GART translation table, in pages.
    pub gart_pages: u64,
    /// TTM regions keep normal CPU caching while bound unless the client asks otherwise.
    pub cached_by_default: bool,
}

impl HwConfig {
    /// Looks up the configuration for a PCI device ID.
    pub fn for_chip_id(chip_id: u32) -> Option<&'static HwConfig> {
        ALL.iter().copied().find(|cfg| cfg.chip_id == chip_id)
    }
}

/// Intel i915G.
pub const I915: &HwConfig = &i915::HWCONFIG;
/// Intel i830M.
pub const I830: &HwConfig = &i830::HWCONFIG;
/// ATI Radeon R200 family.
pub const RADEON_R200: &HwConfig = &radeon::HWCONFIG_R200;
/// Matrox G400.
pub const MGA_G400: &HwConfig = &mga::HWCONFIG_G400;

const ALL: &[&HwConfig] = &[I915, I830, RADEON_R200, MGA_G400];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let cfg = HwConfig::for_chip_id(0x2582).unwrap();
        assert_eq!(cfg.name, "i915");
        assert!(cfg.fence_types <= crate::sarea::MAX_FENCE_TYPES as u32);
        assert!(HwConfig::for_chip_id(0).is_none());
        for cfg in ALL {
            assert!(cfg.fence_types >= 1);
            assert!(cfg.gart_pages > 0);
        }
    }
}

// SPDX-License-Identifier: GPL-2.0-only OR MIT
#![allow(dead_code)]

//! Debug enable/disable flags and convenience macros

#[allow(unused_imports)]
pub(crate) use crate::{cls_pr_debug, debug, mod_dev_dbg, mod_pr_debug};
use core::sync::atomic::{AtomicU64, Ordering};

static DEBUG_FLAGS: AtomicU64 = AtomicU64::new(0);

/// Debug flag bit indices
#[derive(Copy, Clone, Debug)]
pub enum DebugFlags {
    // 0-3: Core data structures
    HashTab = 0,
    Mm = 1,
    Mem = 2,

    // 4-7: Memory objects
    Object = 4,
    Region = 5,
    Agp = 6,

    // 8-11: Residency
    Aperture = 8,
    Fence = 9,
    Evict = 10,

    // 12-15: Interfaces
    Driver = 12,
    File = 13,
    Client = 14,

    // 32-: Behavior flags
    NoPeriodicFence = 32,
}

/// Update the cached global debug flags.
///
/// Called from device creation with the value of `Params::debug_flags`, and may be called at any
/// later time to change which classes log.
pub fn update_debug_flags(flags: u64) {
    DEBUG_FLAGS.store(flags, Ordering::Relaxed);
}

/// Returns the current debug flags.
pub fn debug_flags() -> u64 {
    DEBUG_FLAGS.load(Ordering::Relaxed)
}

/// Check whether debug is enabled for a given flag
#[inline(always)]
pub fn debug_enabled(flag: DebugFlags) -> bool {
    DEBUG_FLAGS.load(Ordering::Relaxed) & 1 << (flag as usize) != 0
}

/// Run some code only if debug is enabled for the calling module
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::debug::debug_enabled(DEBUG_CLASS) {
            $($arg)*
        }
    };
}

/// log::info!() if debug is enabled for the calling module
#[macro_export]
macro_rules! mod_pr_debug (
    ($($arg:tt)*) => (
        $crate::debug! { ::log::info! ( $($arg)* ); }
    )
);

/// log::info!() tagged with a device name, if debug is enabled for the calling module
#[macro_export]
macro_rules! mod_dev_dbg (
    ($dev:expr, $($arg:tt)*) => (
        $crate::debug! { ::log::info! ( target: $dev.name(), $($arg)* ); }
    )
);

/// log::info!() if debug is enabled for a specific module
#[macro_export]
macro_rules! cls_pr_debug (
    ($cls:ident, $($arg:tt)*) => (
        if $crate::debug::debug_enabled($crate::debug::DebugFlags::$cls) {
            ::log::info! ( $($arg)* );
        }
    )
);

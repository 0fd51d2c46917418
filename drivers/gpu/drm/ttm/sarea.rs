// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Shared memory-manager area
//!
//! A small fixed-layout block shared between the kernel side and every client. Clients poll it to
//! learn which fences have retired and whether any buffer may have moved since they last
//! validated, without an ioctl round trip.

use core::sync::atomic::{AtomicU32, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of fence types with slots in the shared area.
pub const MAX_FENCE_TYPES: usize = 8;

/// Handle under which the shared area is published by `MM_INIT`.
pub const SAREA_HANDLE: u32 = 0x5441_0000;

/// Shared area layout.
#[repr(C)]
pub struct Sarea {
    emitted: [AtomicU32; MAX_FENCE_TYPES],
    retired: [AtomicU32; MAX_FENCE_TYPES],
    validation_seq: AtomicU32,
    evict_tt_seq: AtomicU32,
    evict_vram_seq: AtomicU32,
    pad: AtomicU32,
}

crate::no_debug!(Sarea);

/// A plain copy of the shared area, as read by a client in one go.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SareaSnapshot {
    pub emitted: [u32; MAX_FENCE_TYPES],
    pub retired: [u32; MAX_FENCE_TYPES],
    pub validation_seq: u32,
    pub evict_tt_seq: u32,
    pub evict_vram_seq: u32,
    pub pad: u32,
}

const _: () = assert!(core::mem::size_of::<Sarea>() == core::mem::size_of::<SareaSnapshot>());

impl Sarea {
    /// Creates a zeroed shared area.
    pub fn new() -> Sarea {
        Sarea {
            emitted: Default::default(),
            retired: Default::default(),
            validation_seq: AtomicU32::new(0),
            evict_tt_seq: AtomicU32::new(0),
            evict_vram_seq: AtomicU32::new(0),
            pad: AtomicU32::new(0),
        }
    }

    /// Publishes a newly emitted sequence number.
    pub fn set_emitted(&self, fence_type: u32, seq: u32) {
        if let Some(slot) = self.emitted.get(fence_type as usize) {
            slot.store(seq, Ordering::Release);
        }
    }

    /// Publishes the hardware's retired counter.
    pub fn set_retired(&self, fence_type: u32, seq: u32) {
        if let Some(slot) = self.retired.get(fence_type as usize) {
            slot.store(seq, Ordering::Release);
        }
    }

    /// Returns the last published emitted sequence for a fence type.
    pub fn emitted(&self, fence_type: u32) -> Option<u32> {
        self.emitted
            .get(fence_type as usize)
            .map(|s| s.load(Ordering::Acquire))
    }

    /// Returns the last published retired sequence for a fence type.
    pub fn retired(&self, fence_type: u32) -> Option<u32> {
        self.retired
            .get(fence_type as usize)
            .map(|s| s.load(Ordering::Acquire))
    }

    /// Notes that a batch validated buffers.
    pub fn bump_validation(&self) -> u32 {
        self.validation_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Notes that a region was evicted from the GART aperture.
    pub fn bump_evict_tt(&self) -> u32 {
        self.evict_tt_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Reads the whole area.
    pub fn snapshot(&self) -> SareaSnapshot {
        let mut snap = SareaSnapshot {
            validation_seq: self.validation_seq.load(Ordering::Acquire),
            evict_tt_seq: self.evict_tt_seq.load(Ordering::Acquire),
            evict_vram_seq: self.evict_vram_seq.load(Ordering::Acquire),
            ..Default::default()
        };
        for (dst, src) in snap.emitted.iter_mut().zip(self.emitted.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        for (dst, src) in snap.retired.iter_mut().zip(self.retired.iter()) {
            *dst = src.load(Ordering::Acquire);
        }
        snap
    }
}

impl Default for Sarea {
    fn default() -> Self {
        Sarea::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_snapshot() {
        let sarea = Sarea::new();
        sarea.set_emitted(1, 10);
        sarea.set_retired(1, 8);
        sarea.set_emitted(MAX_FENCE_TYPES as u32, 99);
        assert_eq!(sarea.bump_validation(), 1);
        assert_eq!(sarea.bump_evict_tt(), 1);
        assert_eq!(sarea.bump_evict_tt(), 2);

        let snap = sarea.snapshot();
        assert_eq!(snap.emitted[1], 10);
        assert_eq!(snap.retired[1], 8);
        assert_eq!(snap.validation_seq, 1);
        assert_eq!(snap.evict_tt_seq, 2);
        assert_eq!(snap.evict_vram_seq, 0);
        assert_eq!(sarea.emitted(MAX_FENCE_TYPES as u32), None);

        let bytes = snap.as_bytes();
        assert_eq!(bytes.len(), core::mem::size_of::<SareaSnapshot>());
        assert_eq!(SareaSnapshot::read_from_bytes(bytes).unwrap(), snap);
    }
}

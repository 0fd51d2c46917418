// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! GPU fence management
//!
//! Each engine ("fence type") owns a monotonically incrementing 32-bit sequence counter. Emitting
//! a fence returns the next sequence number; the hardware reports the last sequence it has
//! retired. Sequence numbers wrap, so "has `seq` retired" is a distance test rather than a plain
//! comparison.
//!
//! This module defines the driver contract used by the aperture manager, and `SoftFence`, a
//! software fence engine that stands in for the hardware breadcrumb/IRQ machinery.

use crate::debug::*;
use crate::error::{Result, TtmError};

use core::cmp;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

const DEBUG_CLASS: DebugFlags = DebugFlags::Fence;

/// Maximum distance behind the retired counter at which a sequence still counts as retired.
pub const FENCE_WRAP_WINDOW: u32 = 1 << 23;

/// Represents a sequence value of one fence type.
#[derive(Eq, PartialEq, Copy, Clone, Debug, Default)]
#[repr(transparent)]
pub struct FenceValue(pub u32);

impl FenceValue {
    /// Returns the `FenceValue` that succeeds this one.
    pub fn next(&self) -> FenceValue {
        FenceValue(self.0.wrapping_add(1))
    }

    /// Computes the signed distance between this value and another one.
    pub fn delta(&self, other: &FenceValue) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Returns true if a fence with this value has retired, given the engine's retired counter.
    pub fn passed(&self, retired: FenceValue) -> bool {
        retired.0.wrapping_sub(self.0) < FENCE_WRAP_WINDOW
    }
}

impl PartialOrd for FenceValue {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FenceValue {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.delta(other).cmp(&0)
    }
}

/// How long a blocking fence wait may take before the engine is declared hung.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Length of one wait slice.
    pub slice: Duration,
    /// Number of slices without progress before giving up with `HardwareTimeout`.
    pub retries: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            slice: Duration::from_millis(100),
            retries: 30,
        }
    }
}

/// Driver contract for fence emission and completion tracking.
pub trait FenceDriver: Send + Sync {
    /// Number of independent fence types (engines).
    fn fence_types(&self) -> u32;

    /// True if the driver emits a fence on every command submission by itself, so that the
    /// memory manager never needs to emit one explicitly.
    fn kernel_emits_fences(&self) -> bool;

    /// Emits a new fence of the given type and returns its sequence number.
    fn emit(&self, fence_type: u32) -> Result<u32>;

    /// Returns the most recently emitted sequence number of the given type.
    fn last_emitted(&self, fence_type: u32) -> Result<u32>;

    /// Returns the most recently retired sequence number of the given type.
    fn retired(&self, fence_type: u32) -> Result<u32>;

    /// Non-blocking completion test.
    fn test(&self, fence_type: u32, seq: u32) -> Result<bool> {
        Ok(FenceValue(seq).passed(FenceValue(self.retired(fence_type)?)))
    }

    /// Blocks until the fence retires.
    ///
    /// Returns `Interrupted` if the wait was cancelled by a signal and `HardwareTimeout` if the
    /// engine made no progress within the policy's budget.
    fn wait(&self, fence_type: u32, seq: u32, policy: &WaitPolicy) -> Result;
}

/// Inner state of the software engine.
struct SoftFenceInner {
    emitted: Vec<u32>,
    retired: Vec<u32>,
    emit_calls: Vec<u64>,
    interrupt_pending: bool,
    auto_retire: bool,
}

/// A software fence engine.
///
/// Submissions are retired only when the owner calls `retire`/`retire_all`, unless auto-retire
/// is enabled, in which case every fence retires as soon as it is emitted (an idle GPU).
pub struct SoftFence {
    fence_types: u32,
    kernel_emits: bool,
    inner: Mutex<SoftFenceInner>,
    cond: Condvar,
}

crate::no_debug!(SoftFence);

impl SoftFence {
    /// Creates a new engine with `fence_types` independent counters.
    pub fn new(fence_types: u32, kernel_emits: bool) -> SoftFence {
        let n = fence_types.max(1) as usize;
        SoftFence {
            fence_types: fence_types.max(1),
            kernel_emits,
            inner: Mutex::new(SoftFenceInner {
                emitted: vec![0; n],
                retired: vec![0; n],
                emit_calls: vec![0; n],
                interrupt_pending: false,
                auto_retire: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Makes every emitted fence retire immediately.
    pub fn set_auto_retire(&self, auto_retire: bool) {
        let mut inner = self.inner.lock();
        inner.auto_retire = auto_retire;
        if auto_retire {
            let emitted = inner.emitted.clone();
            inner.retired = emitted;
            self.cond.notify_all();
        }
    }

    fn check_type(&self, fence_type: u32) -> Result<usize> {
        if fence_type >= self.fence_types {
            Err(TtmError::InvalidArgument("fence type"))
        } else {
            Ok(fence_type as usize)
        }
    }

    /// Models a command submission: bumps the emitted counter as the hardware ring would.
    pub fn submit(&self, fence_type: u32) -> Result<u32> {
        let idx = self.check_type(fence_type)?;
        let mut inner = self.inner.lock();
        let seq = inner.emitted[idx].wrapping_add(1);
        inner.emitted[idx] = seq;
        if inner.auto_retire {
            inner.retired[idx] = seq;
            self.cond.notify_all();
        }
        Ok(seq)
    }

    /// Reports that the hardware retired all work up to `seq`.
    pub fn retire(&self, fence_type: u32, seq: u32) -> Result {
        let idx = self.check_type(fence_type)?;
        let mut inner = self.inner.lock();
        if FenceValue(inner.retired[idx]) < FenceValue(seq) {
            inner.retired[idx] = seq;
            mod_pr_debug!("SoftFence: type {} retired {:#x}", fence_type, seq);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Retires every emitted fence of every type.
    pub fn retire_all(&self) {
        let mut inner = self.inner.lock();
        let emitted = inner.emitted.clone();
        inner.retired = emitted;
        self.cond.notify_all();
    }

    /// Raises a pending signal: the next (or current) blocking wait returns `Interrupted`.
    pub fn interrupt(&self) {
        self.inner.lock().interrupt_pending = true;
        self.cond.notify_all();
    }

    /// Returns how many times `emit` was called for a fence type.
    pub fn emit_calls(&self, fence_type: u32) -> u64 {
        self.inner
            .lock()
            .emit_calls
            .get(fence_type as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl FenceDriver for SoftFence {
    fn fence_types(&self) -> u32 {
        self.fence_types
    }

    fn kernel_emits_fences(&self) -> bool {
        self.kernel_emits
    }

    fn emit(&self, fence_type: u32) -> Result<u32> {
        let idx = self.check_type(fence_type)?;
        self.inner.lock().emit_calls[idx] += 1;
        let seq = self.submit(fence_type)?;
        mod_pr_debug!("SoftFence: type {} emitted {:#x}", fence_type, seq);
        Ok(seq)
    }

    fn last_emitted(&self, fence_type: u32) -> Result<u32> {
        let idx = self.check_type(fence_type)?;
        Ok(self.inner.lock().emitted[idx])
    }

    fn retired(&self, fence_type: u32) -> Result<u32> {
        let idx = self.check_type(fence_type)?;
        Ok(self.inner.lock().retired[idx])
    }

    fn wait(&self, fence_type: u32, seq: u32, policy: &WaitPolicy) -> Result {
        let idx = self.check_type(fence_type)?;
        let mut inner = self.inner.lock();
        let mut slices = 0;
        let mut deadline = Instant::now() + policy.slice;

        loop {
            if FenceValue(seq).passed(FenceValue(inner.retired[idx])) {
                return Ok(());
            }
            if inner.interrupt_pending {
                inner.interrupt_pending = false;
                mod_pr_debug!("SoftFence: wait for {}:{:#x} interrupted", fence_type, seq);
                return Err(TtmError::Interrupted);
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                slices += 1;
                if slices >= policy.retries {
                    log::error!(
                        "SoftFence: fence {}:{:#x} not retired (retired {:#x}), engine hung?",
                        fence_type,
                        seq,
                        inner.retired[idx]
                    );
                    return Err(TtmError::HardwareTimeout);
                }
                deadline = Instant::now() + policy.slice;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn short() -> WaitPolicy {
        WaitPolicy {
            slice: Duration::from_millis(5),
            retries: 4,
        }
    }

    #[test]
    fn wraparound_retirement() {
        assert!(FenceValue(5).passed(FenceValue(5)));
        assert!(FenceValue(4).passed(FenceValue(5)));
        assert!(!FenceValue(6).passed(FenceValue(5)));
        // Retired counter wrapped past zero.
        assert!(FenceValue(0xffff_fff0).passed(FenceValue(3)));
        assert!(!FenceValue(3).passed(FenceValue(0xffff_fff0)));
        // Too far behind counts as not yet emitted.
        assert!(!FenceValue(0).passed(FenceValue(FENCE_WRAP_WINDOW)));

        assert!(FenceValue(0xffff_ffff) < FenceValue(1));
        assert_eq!(FenceValue(0xffff_ffff).next(), FenceValue(0));
    }

    #[test]
    fn emit_and_retire() {
        let fence = SoftFence::new(2, false);
        let a = fence.emit(0).unwrap();
        let b = fence.emit(0).unwrap();
        let c = fence.emit(1).unwrap();
        assert_eq!((a, b, c), (1, 2, 1));
        assert_eq!(fence.emit_calls(0), 2);
        assert!(!fence.test(0, a).unwrap());

        fence.retire(0, a).unwrap();
        assert!(fence.test(0, a).unwrap());
        assert!(!fence.test(0, b).unwrap());
        assert!(fence.wait(0, a, &short()).is_ok());
        assert!(fence.emit(2).is_err());
    }

    #[test]
    fn wait_blocks_until_retired() {
        let fence = Arc::new(SoftFence::new(1, false));
        let seq = fence.emit(0).unwrap();

        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait(0, seq, &WaitPolicy::default()))
        };
        thread::sleep(Duration::from_millis(20));
        fence.retire(0, seq).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn wait_timeout_and_interrupt() {
        let fence = SoftFence::new(1, false);
        let seq = fence.emit(0).unwrap();
        assert_eq!(fence.wait(0, seq, &short()), Err(TtmError::HardwareTimeout));

        fence.interrupt();
        assert_eq!(fence.wait(0, seq, &short()), Err(TtmError::Interrupted));
        // The signal is consumed by the first wait.
        assert_eq!(fence.wait(0, seq, &short()), Err(TtmError::HardwareTimeout));
    }

    #[test]
    fn auto_retire_and_submit() {
        let fence = SoftFence::new(1, true);
        assert!(fence.kernel_emits_fences());
        let seq = fence.submit(0).unwrap();
        assert_eq!(fence.last_emitted(0).unwrap(), seq);
        assert_eq!(fence.emit_calls(0), 0);
        fence.set_auto_retire(true);
        assert!(fence.test(0, seq).unwrap());
        let next = fence.submit(0).unwrap();
        assert!(fence.test(0, next).unwrap());
    }
}

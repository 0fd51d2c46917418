// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Error type shared by every layer of the memory manager.

use std::collections::TryReserveError;
use thiserror::Error;

/// An error generated while using this crate.
///
/// Variants are kept in alphabetical order.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TtmError {
    /// A TTM is still mapped by a VMA; the request was deferred.
    #[error("object busy")]
    Busy,
    /// A hash table already holds an item with this key.
    #[error("duplicate hash key")]
    DuplicateKey,
    /// A fence wait ran out of retries. The engine may be hung.
    #[error("hardware fence timeout")]
    HardwareTimeout,
    /// A blocking wait was cancelled by a pending signal. The caller may retry.
    #[error("interrupted")]
    Interrupted,
    /// Malformed request: bad range, overlap, unknown op or flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// User memory could not be pinned or copied.
    #[error("invalid user buffer")]
    InvalidBuffer,
    /// The object is not in a state that allows this transition.
    #[error("invalid region state")]
    InvalidState,
    /// Every key in the requested key space is in use.
    #[error("hash key space exhausted")]
    KeySpaceExhausted,
    /// The memory manager is not initialized, or was taken down.
    #[error("no memory manager")]
    NoDevice,
    /// No object with this handle exists.
    #[error("no such handle")]
    NotFound,
    /// Nothing evictable is left and the aperture has no room.
    #[error("out of aperture space")]
    OutOfApertureSpace,
    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// The object belongs to another client.
    #[error("permission denied")]
    PermissionDenied,
}

impl TtmError {
    /// Returns the negative errno reported to clients for this error.
    pub fn to_errno(self) -> i32 {
        -(match self {
            TtmError::Busy => libc::EBUSY,
            TtmError::DuplicateKey => libc::EEXIST,
            TtmError::HardwareTimeout => libc::ETIMEDOUT,
            TtmError::Interrupted => libc::EINTR,
            TtmError::InvalidArgument(_) | TtmError::InvalidState => libc::EINVAL,
            TtmError::InvalidBuffer => libc::EFAULT,
            TtmError::KeySpaceExhausted | TtmError::OutOfApertureSpace => libc::ENOSPC,
            TtmError::NoDevice => libc::ENODEV,
            TtmError::NotFound => libc::ENOENT,
            TtmError::OutOfMemory => libc::ENOMEM,
            TtmError::PermissionDenied => libc::EPERM,
        })
    }

    /// Converts a negative errno from a result slot back into an error.
    ///
    /// Returns `None` for 0 (success). Unknown codes map to `InvalidArgument`.
    pub fn from_errno(errno: i32) -> Option<TtmError> {
        let err = match -errno {
            0 => return None,
            libc::EBUSY => TtmError::Busy,
            libc::EEXIST => TtmError::DuplicateKey,
            libc::ETIMEDOUT => TtmError::HardwareTimeout,
            libc::EINTR => TtmError::Interrupted,
            libc::EFAULT => TtmError::InvalidBuffer,
            libc::ENOSPC => TtmError::OutOfApertureSpace,
            libc::ENODEV => TtmError::NoDevice,
            libc::ENOENT => TtmError::NotFound,
            libc::ENOMEM => TtmError::OutOfMemory,
            libc::EPERM => TtmError::PermissionDenied,
            _ => TtmError::InvalidArgument("errno"),
        };
        Some(err)
    }

    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(self) -> bool {
        matches!(self, TtmError::Interrupted | TtmError::Busy)
    }
}

impl From<TryReserveError> for TtmError {
    fn from(_e: TryReserveError) -> TtmError {
        TtmError::OutOfMemory
    }
}

/// The result of an operation in this crate.
pub type Result<T = ()> = core::result::Result<T, TtmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(TtmError::OutOfMemory.to_errno(), -libc::ENOMEM);
        assert_eq!(TtmError::OutOfApertureSpace.to_errno(), -libc::ENOSPC);
        assert_eq!(TtmError::from_errno(0), None);
        assert_eq!(
            TtmError::from_errno(TtmError::Interrupted.to_errno()),
            Some(TtmError::Interrupted)
        );
        assert!(TtmError::Interrupted.is_retryable());
        assert!(!TtmError::HardwareTimeout.is_retryable());
    }
}

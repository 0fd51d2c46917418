// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Texture/tiled memory manager for legacy DRM GPUs.
//!
//! Multiplexes a small GART aperture across many bindable buffer regions, tracks GPU completion
//! with per-engine fence sequence numbers, and evicts least-recently-fenced regions when the
//! aperture runs out of space. Hardware collaborators (GART, fence engine, process memory) are
//! modeled in software behind the same trait seams a real driver would implement.

#![allow(clippy::new_without_default)]

pub mod agp;
pub mod aperture;
pub mod client;
pub mod debug;
pub mod driver;
pub mod error;
pub mod fence;
pub mod file;
pub mod hashtab;
pub mod hw;
pub mod mem;
pub mod mm;
pub mod object;
pub mod region;
pub mod sarea;
pub mod uapi;
mod util;

pub use driver::{Params, TtmDevice};
pub use error::{Result, TtmError};

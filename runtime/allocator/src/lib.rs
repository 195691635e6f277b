//! HVS Allocator - Address-range and handle allocation for composition memory
//!
//! # Purpose
//! The compositor owns a handful of fixed-size on-chip memories (display-list
//! context RAM, line-buffer memory, unified pixel memory). Every consumer of
//! those memories asks for a contiguous range of words; this crate hands the
//! ranges out and takes them back.
//!
//! # Integration Points
//! - Depends on: nothing hardware specific
//! - Provides to: `hvs` (arenas behind the device lock)
//! - Capabilities required: none, pure bookkeeping
//!
//! # Architecture
//! - [`RangeAllocator`]: first-fit allocator over a fixed extent. Live ranges
//!   are kept sorted by start address, so holes are simply the gaps between
//!   neighbours and adjacent free space merges without any extra work.
//! - [`HandleTable`]: small table of refcounted handles, each backed by a
//!   range from its own arena. Users asking for the same size share a
//!   handle instead of churning the arena.
//!
//! # Testing Strategy
//! - Unit tests: first-fit placement, hole reuse, exhaustion, handle sharing
//! - Benchmarks: allocate/free churn (`benches/range_allocator.rs`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod handles;
mod range;

pub use handles::{Handle, HandleInfo, HandleTable, DEFAULT_HANDLE_SLOTS};
pub use range::{Allocation, RangeAllocator};

use thiserror::Error;

/// Error types for range and handle allocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("No contiguous range of {requested} words (free: {available})")]
    OutOfSpace { requested: usize, available: usize },

    #[error("Allocation size must be non-zero")]
    InvalidSize,

    #[error("Range [{start:#x} + {size:#x}] is not allocated from this arena")]
    UnknownAllocation { start: usize, size: usize },

    #[error("Out of handle slots")]
    OutOfHandles,

    #[error("Invalid handle {handle}")]
    InvalidHandle { handle: u32 },
}

pub type Result<T> = core::result::Result<T, AllocError>;

//! HVS - Composition memory management for the hardware video scaler
//!
//! # Purpose
//! The scaler composes every display output from display lists stored in its
//! own context memory, with line buffers and a pixel cache alongside. All
//! output channels share those memories, and the hardware keeps reading a
//! display list for an unknown time after software stopped pointing at it.
//! This crate partitions the memories between channels and only recycles a
//! display list once the hardware has certainly moved past it.
//!
//! # Integration Points
//! - Depends on: `hvs-allocator` (arenas), a [`RegisterBus`] implementation
//!   for register and display-list memory access
//! - Provides to: the composition commit path, the interrupt routing layer
//! - Interrupts: one shared status interrupt (VC4/VC5) or one end-of-frame
//!   line per channel (gen 6), both delivered through
//!   [`HvsDevice::handle_irq`]
//!
//! # Architecture
//! - [`HvsDevice`] owns the three arenas and the deferred-free queue behind
//!   a single lock, plus per-channel state and the sweep worker.
//! - Replaced display lists are retired, not freed: each is tagged with the
//!   frame count one past the current one and reclaimed once the channel's
//!   counter reaches it (or the channel is disabled).
//! - End-of-frame interrupts schedule the [sweep worker](sweep), which does
//!   the reclaiming outside interrupt context.
//! - [`Generation`] hides the register-level differences between hardware
//!   generations.
//!
//! # Testing Strategy
//! - Unit tests: frame-counter wraparound, queue eligibility, channel state
//!   transitions, worker coalescing
//! - Integration tests: whole-device scenarios against [`mock::MockHvs`]

pub mod channel;
pub mod config;
pub mod device;
pub mod dlist;
pub mod frcnt;
pub mod generation;
pub mod irq;
pub mod regs;
pub mod snapshot;
pub mod stale;
pub mod sweep;

#[cfg(feature = "mock")]
pub mod mock;

pub use channel::{ChannelId, ChannelState, GammaLut, Geometry, MAX_CHANNELS};
pub use config::HvsConfig;
pub use device::HvsDevice;
pub use dlist::{DlistAllocation, DlistBuilder, FilterKernel};
pub use frcnt::{frcnt_lte, FrameCount};
pub use generation::Generation;
pub use hvs_allocator::{AllocError, Allocation, Handle, HandleInfo};
pub use irq::{IrqReturn, IrqSource};
pub use regs::{Access, Reg, RegisterBus};
pub use snapshot::MmSnapshot;

use thiserror::Error;

/// Error types for composition memory and channel operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HvsError {
    #[error("Out of {arena} memory (requested: {requested} words)")]
    ResourceExhausted {
        arena: &'static str,
        requested: usize,
    },

    #[error("Channel {channel} did not reach idle on disable: {detail}")]
    InconsistentHardwareState { channel: usize, detail: String },

    #[error("Unknown hardware generation: {compatible}")]
    UnknownHardwareGeneration { compatible: String },

    #[error("Invalid channel {channel}")]
    InvalidChannel { channel: usize },

    #[error("Invalid geometry {width}x{height} for channel {channel}")]
    InvalidGeometry {
        channel: usize,
        width: u32,
        height: u32,
    },

    #[error("Channel {channel} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        channel: usize,
        from: ChannelState,
        to: ChannelState,
    },

    #[error("Display list belongs to channel {owner}, not channel {channel}")]
    ChannelMismatch { channel: usize, owner: usize },

    #[error("Display list at {start:#x} has not been populated")]
    DlistNotPopulated { start: usize },

    #[error("Display list at {start:#x} is already programmed")]
    DlistProgrammed { start: usize },

    #[error("Display list size mismatch (allocated: {expected}, written: {actual})")]
    DlistSizeMismatch { expected: usize, actual: usize },

    #[error("Device is no longer present")]
    DeviceGone,

    #[error("Failed to start sweep worker: {0}")]
    WorkerSpawn(String),

    #[error("Device has been torn down")]
    ShutDown,

    #[error("Allocator error: {0}")]
    Alloc(#[from] AllocError),
}

impl HvsError {
    /// Map an arena failure, reporting lack of space as exhaustion of `arena`
    pub(crate) fn from_arena(arena: &'static str, requested: usize) -> impl FnOnce(AllocError) -> Self {
        move |err| match err {
            AllocError::OutOfSpace { .. } | AllocError::OutOfHandles => {
                HvsError::ResourceExhausted { arena, requested }
            }
            other => HvsError::Alloc(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, HvsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_errors_map_to_exhaustion() {
        let err = HvsError::from_arena("dlist", 100)(AllocError::OutOfSpace {
            requested: 100,
            available: 50,
        });
        assert_eq!(
            err,
            HvsError::ResourceExhausted {
                arena: "dlist",
                requested: 100
            }
        );

        let err = HvsError::from_arena("upm", 8)(AllocError::OutOfHandles);
        assert!(matches!(err, HvsError::ResourceExhausted { arena: "upm", .. }));

        let err = HvsError::from_arena("dlist", 0)(AllocError::InvalidSize);
        assert_eq!(err, HvsError::Alloc(AllocError::InvalidSize));
    }

    #[test]
    fn test_error_messages() {
        let err = HvsError::ResourceExhausted {
            arena: "dlist",
            requested: 100,
        };
        assert_eq!(err.to_string(), "Out of dlist memory (requested: 100 words)");

        let err: HvsError = AllocError::InvalidHandle { handle: 4 }.into();
        assert_eq!(err.to_string(), "Allocator error: Invalid handle 4");
    }
}

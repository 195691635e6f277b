//! Channel state machine
//!
//! A channel is one composition pipeline feeding one output. Its software
//! view moves through `Disabled -> Resetting -> Enabled -> Disabled`:
//! the reset pulse is the `Resetting` step, and the channel only counts as
//! enabled once the control register holds the final enable image.
//!
//! The register sequences themselves belong to the generation profile; this
//! module only tracks state and validates transitions.

use crate::{HvsError, Result};
use core::fmt;

/// Number of composition channels on every supported generation
pub const MAX_CHANNELS: usize = 3;

/// Entries per colour component in a gamma table
pub const GAMMA_ENTRIES: usize = 256;

/// Index of a composition channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Channel `index`
    ///
    /// # Errors
    /// `InvalidChannel` if `index` is not below [`MAX_CHANNELS`].
    pub fn new(index: usize) -> Result<Self> {
        if index < MAX_CHANNELS {
            Ok(Self(index as u8))
        } else {
            Err(HvsError::InvalidChannel { channel: index })
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Every channel, in index order
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8).map(ChannelId)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Software view of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disabled,
    Resetting,
    Enabled,
}

/// Output timing the channel is programmed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Active width in pixels
    pub width: u32,
    /// Active height in lines
    pub height: u32,
    /// Produce a single frame per trigger instead of running continuously
    pub oneshot: bool,
    pub interlaced: bool,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            oneshot: false,
            interlaced: false,
        }
    }

    pub fn oneshot(mut self, oneshot: bool) -> Self {
        self.oneshot = oneshot;
        self
    }

    pub fn interlaced(mut self, interlaced: bool) -> Self {
        self.interlaced = interlaced;
        self
    }

    pub(crate) fn validate(&self, channel: ChannelId) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(HvsError::InvalidGeometry {
                channel: channel.index(),
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

/// Per-channel gamma lookup table, one 256-entry ramp per component
#[derive(Clone, PartialEq, Eq)]
pub struct GammaLut {
    pub red: [u8; GAMMA_ENTRIES],
    pub green: [u8; GAMMA_ENTRIES],
    pub blue: [u8; GAMMA_ENTRIES],
}

impl GammaLut {
    /// Identity ramp
    pub fn linear() -> Self {
        let mut ramp = [0u8; GAMMA_ENTRIES];
        for (i, v) in ramp.iter_mut().enumerate() {
            *v = i as u8;
        }
        Self {
            red: ramp,
            green: ramp,
            blue: ramp,
        }
    }

    /// Components in the order the hardware expects them
    pub(crate) fn components(&self) -> [&[u8; GAMMA_ENTRIES]; 3] {
        [&self.red, &self.green, &self.blue]
    }
}

impl fmt::Debug for GammaLut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GammaLut")
            .field("linear", &(*self == Self::linear()))
            .finish_non_exhaustive()
    }
}

/// Mutable per-channel record, lives behind the channel lock
#[derive(Debug, Default)]
pub(crate) struct Channel {
    pub state: ChannelState,
    pub geometry: Option<Geometry>,
    /// Start of the display list the hardware was last pointed at
    pub current_dlist: Option<usize>,
    pub gamma: Option<GammaLut>,
    /// Background fill requested by the last commit (gen 6 applies it at EOF)
    pub bg_fill: bool,
    /// Last idle-check failure seen when disabling
    pub last_diagnostic: Option<HvsError>,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.state == ChannelState::Enabled
    }

    /// Move to `next`, rejecting transitions the state machine does not have
    pub fn transition(&mut self, id: ChannelId, next: ChannelState) -> Result<()> {
        use ChannelState::*;

        let allowed = matches!(
            (self.state, next),
            (Disabled, Resetting) | (Resetting, Enabled) | (Enabled, Disabled) | (Resetting, Disabled)
        );

        if !allowed {
            return Err(HvsError::InvalidTransition {
                channel: id.index(),
                from: self.state,
                to: next,
            });
        }

        log::trace!("channel {}: {:?} -> {:?}", id, self.state, next);
        self.state = next;
        Ok(())
    }
}

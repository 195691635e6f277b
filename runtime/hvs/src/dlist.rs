//! Display lists and scaler filter kernels
//!
//! A display list is the per-frame sequence of plane descriptors the
//! scaler walks, terminated by an end word. Building one is plain
//! concatenation; the interesting part is the life cycle of the memory it
//! lives in, tracked by [`DlistAllocation`].

use crate::channel::ChannelId;
use crate::regs::DLIST_END;
use hvs_allocator::Allocation;

/// Display-list memory owned by one composition commit
///
/// Moves through three stages: reserved (fresh from the arena), populated
/// (descriptors written) and programmed (a channel's list pointer refers
/// to it). Only a programmed allocation has to go through deferred free.
#[derive(Debug)]
pub struct DlistAllocation {
    pub(crate) range: Allocation,
    pub(crate) channel: ChannelId,
    pub(crate) populated: bool,
    pub(crate) programmed: bool,
}

impl DlistAllocation {
    pub(crate) fn new(range: Allocation, channel: ChannelId) -> Self {
        Self {
            range,
            channel,
            populated: false,
            programmed: false,
        }
    }

    /// First word in display-list memory
    pub fn start(&self) -> usize {
        self.range.start()
    }

    /// Length in words, end word included
    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn is_programmed(&self) -> bool {
        self.programmed
    }
}

/// Accumulates plane descriptors into one display list
#[derive(Debug, Default, Clone)]
pub struct DlistBuilder {
    words: Vec<u32>,
    planes: usize,
}

impl DlistBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one plane's descriptor words
    pub fn push_plane(&mut self, descriptor: &[u32]) -> &mut Self {
        self.words.extend_from_slice(descriptor);
        self.planes += 1;
        self
    }

    pub fn plane_count(&self) -> usize {
        self.planes
    }

    /// Words the finished list needs, end word included
    pub fn word_count(&self) -> usize {
        self.words.len() + 1
    }

    /// Terminate the list
    pub fn finish(mut self) -> Vec<u32> {
        self.words.push(DLIST_END);
        self.words
    }
}

/// The filter kernels uploaded at bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKernel {
    /// Mitchell-Netravali, B = C = 1/3
    MitchellNetravali,
    NearestNeighbour,
}

/// Words in a half (linear-phase) kernel
pub const LINEAR_PHASE_KERNEL_WORDS: usize = 6;

/// Words in an uploaded kernel
pub const KERNEL_WORDS: usize = LINEAR_PHASE_KERNEL_WORDS * 2 - 1;

/// Pack three signed 9-bit coefficients into one word
const fn filter_word(c0: i32, c1: i32, c2: i32) -> u32 {
    ((c0 as u32) & 0x1ff) | (((c1 as u32) & 0x1ff) << 9) | (((c2 as u32) & 0x1ff) << 18)
}

/// First half of a linear-phase kernel from coefficients 0..=15
const fn linear_phase(c: [i32; 16]) -> [u32; LINEAR_PHASE_KERNEL_WORDS] {
    [
        filter_word(c[0], c[1], c[2]),
        filter_word(c[3], c[4], c[5]),
        filter_word(c[6], c[7], c[8]),
        filter_word(c[9], c[10], c[11]),
        filter_word(c[12], c[13], c[14]),
        filter_word(c[15], c[15], 0),
    ]
}

const MITCHELL_NETRAVALI: [u32; LINEAR_PHASE_KERNEL_WORDS] = linear_phase([
    0, -2, -6, -8, -10, -8, -3, 2, 18, 50, 82, 119, 155, 187, 213, 227,
]);

const NEAREST_NEIGHBOUR: [u32; LINEAR_PHASE_KERNEL_WORDS] =
    linear_phase([0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 255, 255, 255, 255]);

impl FilterKernel {
    pub const ALL: [FilterKernel; 2] = [Self::MitchellNetravali, Self::NearestNeighbour];

    /// The kernel as uploaded: the first half, then the first five words
    /// again in reverse order
    pub fn words(self) -> [u32; KERNEL_WORDS] {
        let half = match self {
            Self::MitchellNetravali => &MITCHELL_NETRAVALI,
            Self::NearestNeighbour => &NEAREST_NEIGHBOUR,
        };

        let mut out = [0u32; KERNEL_WORDS];
        for (i, word) in out.iter_mut().enumerate() {
            *word = if i < LINEAR_PHASE_KERNEL_WORDS {
                half[i]
            } else {
                half[KERNEL_WORDS - i - 1]
            };
        }
        out
    }
}

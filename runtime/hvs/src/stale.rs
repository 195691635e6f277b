//! Deferred-free queue
//!
//! Display lists that may still be read by the hardware FIFO cannot go
//! back to the arena right away. They wait here, tagged with their channel
//! and the frame count at which the hardware is certainly done with them.
//!
//! Every entry also carries a sequence number. The sweep reads hardware
//! state outside the arena lock, so it first records the sequence number
//! it started from and only judges entries older than that: an entry
//! queued while the sweep was reading registers is left for the next one.

use crate::channel::{ChannelId, MAX_CHANNELS};
use crate::frcnt::FrameCount;
use hvs_allocator::Allocation;

/// One display list waiting for the hardware to move past it
#[derive(Debug)]
pub struct StaleEntry {
    pub alloc: Allocation,
    pub channel: ChannelId,
    /// Frame count at which the range is no longer read
    pub target: FrameCount,
    seq: u64,
}

/// Hardware state of one channel as seen by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSample {
    pub active: bool,
    pub frame_count: FrameCount,
}

impl ChannelSample {
    pub const INACTIVE: Self = Self {
        active: false,
        frame_count: FrameCount::new(0),
    };
}

impl StaleEntry {
    /// A disabled channel reads nothing; an active one is done once its
    /// counter reached the target
    pub fn reclaimable(&self, sample: ChannelSample) -> bool {
        !sample.active || self.target.reached_by(sample.frame_count)
    }
}

/// FIFO of stale display lists
#[derive(Debug, Default)]
pub struct StaleQueue {
    entries: Vec<StaleEntry>,
    next_seq: u64,
}

impl StaleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alloc: Allocation, channel: ChannelId, target: FrameCount) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(StaleEntry {
            alloc,
            channel,
            target,
            seq,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still queued for `channel`
    pub fn len_for(&self, channel: ChannelId) -> usize {
        self.entries.iter().filter(|e| e.channel == channel).count()
    }

    /// Sequence number the next push will get
    pub fn snapshot(&self) -> u64 {
        self.next_seq
    }

    /// Remove every entry queued before `snapshot` that `samples` says the
    /// hardware no longer reads
    pub fn drain_reclaimable(
        &mut self,
        snapshot: u64,
        samples: &[ChannelSample; MAX_CHANNELS],
    ) -> Vec<StaleEntry> {
        let mut reclaimed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for entry in self.entries.drain(..) {
            if entry.seq < snapshot && entry.reclaimable(samples[entry.channel.index()]) {
                reclaimed.push(entry);
            } else {
                kept.push(entry);
            }
        }

        self.entries = kept;
        reclaimed
    }

    /// Empty the queue unconditionally (teardown)
    pub fn drain_all(&mut self) -> Vec<StaleEntry> {
        core::mem::take(&mut self.entries)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaleEntry> + '_ {
        self.entries.iter()
    }
}

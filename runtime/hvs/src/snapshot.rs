//! Point-in-time view of the arenas, for debugging
//!
//! Taken under the arena lock by [`HvsDevice::mm_snapshot`], then printed
//! at leisure. The `Display` output lists live ranges, the deferred-free
//! queue and the handle table.
//!
//! [`HvsDevice::mm_snapshot`]: crate::HvsDevice::mm_snapshot

use crate::channel::ChannelId;
use crate::frcnt::FrameCount;
use hvs_allocator::{HandleInfo, HandleTable, RangeAllocator};
use std::fmt;

/// Live ranges of one arena
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaSnapshot {
    pub name: &'static str,
    pub base: usize,
    pub capacity: usize,
    pub free: usize,
    /// `(start, size)` in address order
    pub live: Vec<(usize, usize)>,
}

impl ArenaSnapshot {
    pub(crate) fn of(arena: &RangeAllocator) -> Self {
        Self {
            name: arena.name(),
            base: arena.base(),
            capacity: arena.capacity(),
            free: arena.free_space(),
            live: arena.iter().collect(),
        }
    }
}

/// One queued display list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleSnapshot {
    pub start: usize,
    pub size: usize,
    pub channel: ChannelId,
    pub target: FrameCount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmSnapshot {
    pub dlist: ArenaSnapshot,
    pub lbm: ArenaSnapshot,
    pub upm: ArenaSnapshot,
    pub stale: Vec<StaleSnapshot>,
    pub handles: Vec<HandleInfo>,
}

impl MmSnapshot {
    pub(crate) fn handles_of(table: &HandleTable) -> Vec<HandleInfo> {
        table.iter().collect()
    }
}

impl fmt::Display for ArenaSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} of {} words free",
            self.name, self.free, self.capacity
        )?;
        for (start, size) in &self.live {
            writeln!(f, "node [{:08x} + {:08x}]", start, size)?;
        }
        Ok(())
    }
}

impl fmt::Display for MmSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocated nodes:")?;
        write!(f, "{}", self.dlist)?;

        writeln!(f, "Stale nodes:")?;
        for entry in &self.stale {
            writeln!(
                f,
                "node [{:08x} + {:08x}] channel {} frcnt {}",
                entry.start, entry.size, entry.channel, entry.target
            )?;
        }

        write!(f, "{}", self.lbm)?;

        if self.upm.capacity > 0 {
            write!(f, "{}", self.upm)?;
            writeln!(f, "UPM Handles:")?;
            for h in &self.handles {
                writeln!(
                    f,
                    "handle {}: refcount {}, size {} [{:08x} + {:08x}]",
                    h.handle.get(),
                    h.refcount,
                    h.size,
                    h.start,
                    h.size
                )?;
            }
        }
        Ok(())
    }
}

//! Handle Table - Refcounted handles backed by arena ranges
//!
//! Some hardware resources are referenced from descriptors by a small
//! integer handle rather than by address. Several planes of one commit may
//! want a backing range of the same size at the same time; rather than
//! allocating one range per plane, they share a handle and the table keeps
//! a refcount. The range goes back to the arena when the last user
//! releases the handle.
//!
//! Handles are numbered `1..=K`. Handle 0 is never handed out, so the
//! hardware can use it to mean "no handle".

use crate::{AllocError, Allocation, RangeAllocator, Result};
use alloc::vec::Vec;
use core::num::NonZeroU32;
use static_assertions::const_assert;

/// Default number of handle slots
pub const DEFAULT_HANDLE_SLOTS: usize = 32;

const_assert!(DEFAULT_HANDLE_SLOTS > 0 && DEFAULT_HANDLE_SLOTS < u32::MAX as usize);

/// Handle to a refcounted range, valid values are `1..=K`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(NonZeroU32);

impl Handle {
    /// Rebuild a handle from its raw value (e.g. read back from a descriptor)
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw handle value as written into hardware descriptors
    pub fn get(self) -> u32 {
        self.0.get()
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Snapshot of one handle slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub handle: Handle,
    pub refcount: u32,
    pub start: usize,
    pub size: usize,
}

#[derive(Default)]
struct Slot {
    refcount: u32,
    backing: Option<Allocation>,
}

/// Fixed-size table of refcounted handles over one arena
pub struct HandleTable {
    arena: RangeAllocator,
    slots: Vec<Slot>,
}

impl HandleTable {
    /// Create a table of `slots` handles backed by `arena`
    pub fn new(arena: RangeAllocator, slots: usize) -> Self {
        let mut table = Vec::with_capacity(slots);
        table.resize_with(slots, Slot::default);

        Self {
            arena,
            slots: table,
        }
    }

    /// Backing arena
    pub fn arena(&self) -> &RangeAllocator {
        &self.arena
    }

    /// Number of handle slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of handles with a non-zero refcount
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.refcount > 0).count()
    }

    /// Acquire a handle backed by `size` words
    ///
    /// An existing handle whose backing range has exactly `size` words is
    /// shared (its refcount goes up). Otherwise the first free slot gets a
    /// fresh range from the arena.
    ///
    /// # Errors
    /// - `InvalidSize` for a zero-sized request
    /// - `OutOfHandles` when every slot is in use
    /// - `OutOfSpace` when the arena has no room for a new range
    pub fn acquire(&mut self, size: usize) -> Result<Handle> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }

        let shared = self.slots.iter().position(|s| {
            s.refcount > 0 && s.backing.as_ref().is_some_and(|b| b.size() == size)
        });

        if let Some(index) = shared {
            self.slots[index].refcount += 1;
            return Ok(Self::handle_at(index));
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.refcount == 0)
            .ok_or(AllocError::OutOfHandles)?;

        let backing = self.arena.allocate(size)?;
        let slot = &mut self.slots[index];
        slot.refcount = 1;
        slot.backing = Some(backing);

        log::trace!(
            "{}: handle {} -> {} words",
            self.arena.name(),
            index + 1,
            size
        );

        Ok(Self::handle_at(index))
    }

    /// Drop one reference to `handle`, freeing its range at zero
    ///
    /// # Errors
    /// `InvalidHandle` if the handle is out of range or not in use.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .filter(|s| s.refcount > 0)
            .ok_or(AllocError::InvalidHandle {
                handle: handle.get(),
            })?;

        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(());
        }

        if let Some(backing) = slot.backing.take() {
            self.arena.free(backing)?;
        }
        Ok(())
    }

    /// Current refcount of `handle`, `None` if out of range
    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        self.slots.get(handle.index()).map(|s| s.refcount)
    }

    /// Backing range of `handle` as `(start, size)`, if in use
    pub fn range(&self, handle: Handle) -> Option<(usize, usize)> {
        self.slots
            .get(handle.index())
            .and_then(|s| s.backing.as_ref())
            .map(|b| (b.start(), b.size()))
    }

    /// Snapshot every slot that is currently in use
    pub fn iter(&self) -> impl Iterator<Item = HandleInfo> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.backing.as_ref().map(|b| HandleInfo {
                handle: Self::handle_at(i),
                refcount: s.refcount,
                start: b.start(),
                size: b.size(),
            })
        })
    }

    /// Forget every handle and range
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        self.arena.clear();
    }

    fn handle_at(index: usize) -> Handle {
        // Slot count is bounded well below u32::MAX, index + 1 is non-zero
        Handle(NonZeroU32::MIN.saturating_add(index as u32))
    }
}

//! Range Allocator - First-fit allocation over a fixed address extent
//!
//! Each arena covers `[base, base + capacity)` in words. Live ranges are
//! stored sorted by start address, which makes the free holes implicit: a
//! hole is the gap between two neighbouring live ranges (or between the
//! arena bounds and the outermost ones). Freeing a range removes it from
//! the list, and the gaps on either side merge on their own.
//!
//! No compaction is ever done. Arenas are sized with enough headroom that
//! fragmentation is tolerated.

use crate::{AllocError, Result};
use alloc::vec::Vec;

/// A live range handed out by a [`RangeAllocator`]
///
/// Deliberately neither `Clone` nor `Copy`: whoever holds the value owns
/// the range, and giving it back to [`RangeAllocator::free`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    start: usize,
    size: usize,
}

impl Allocation {
    /// First word of the range
    pub fn start(&self) -> usize {
        self.start
    }

    /// Length of the range in words
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last word of the range
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Check whether two ranges share at least one word
    pub fn overlaps(&self, other: &Allocation) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Live range record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    start: usize,
    size: usize,
}

impl Node {
    fn end(&self) -> usize {
        self.start + self.size
    }
}

/// First-fit range allocator
pub struct RangeAllocator {
    /// Arena name, only used in log output
    name: &'static str,

    /// First allocatable word
    base: usize,

    /// Number of allocatable words
    capacity: usize,

    /// Live ranges, sorted by start
    nodes: Vec<Node>,

    /// Sum of live range sizes
    used: usize,
}

impl RangeAllocator {
    /// Create an arena covering `[base, base + capacity)`
    ///
    /// A zero capacity is allowed; every allocation from such an arena fails.
    pub fn new(name: &'static str, base: usize, capacity: usize) -> Self {
        Self {
            name,
            base,
            capacity,
            nodes: Vec::new(),
            used: 0,
        }
    }

    /// Arena name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First allocatable word
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total allocatable words
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words currently handed out
    pub fn used(&self) -> usize {
        self.used
    }

    /// Words not handed out (possibly fragmented)
    pub fn free_space(&self) -> usize {
        self.capacity - self.used
    }

    /// Number of live ranges
    pub fn live_count(&self) -> usize {
        self.nodes.len()
    }

    /// Largest single range that could be allocated right now
    pub fn largest_hole(&self) -> usize {
        let mut cursor = self.base;
        let mut largest = 0;

        for node in &self.nodes {
            largest = largest.max(node.start - cursor);
            cursor = node.end();
        }

        largest.max(self.base + self.capacity - cursor)
    }

    /// Iterate over live ranges as `(start, size)`, in address order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.nodes.iter().map(|n| (n.start, n.size))
    }

    /// Allocate `size` contiguous words
    ///
    /// Picks the lowest-addressed hole that fits.
    ///
    /// # Errors
    /// - `InvalidSize` for a zero-sized request
    /// - `OutOfSpace` when no hole is large enough
    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }

        let mut cursor = self.base;
        let mut index = self.nodes.len();

        for (i, node) in self.nodes.iter().enumerate() {
            if node.start - cursor >= size {
                index = i;
                break;
            }
            cursor = node.end();
        }

        // Tail hole, only relevant when no inner hole matched
        if index == self.nodes.len() && self.base + self.capacity - cursor < size {
            log::trace!(
                "{}: no hole for {} words ({} free, largest hole {})",
                self.name,
                size,
                self.free_space(),
                self.largest_hole()
            );
            return Err(AllocError::OutOfSpace {
                requested: size,
                available: self.free_space(),
            });
        }

        self.nodes.insert(index, Node { start: cursor, size });
        self.used += size;

        Ok(Allocation {
            start: cursor,
            size,
        })
    }

    /// Return a range to the arena
    ///
    /// # Errors
    /// `UnknownAllocation` if the range is not live in this arena. The arena
    /// is left unchanged in that case.
    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        let index = self
            .nodes
            .binary_search_by_key(&allocation.start, |n| n.start)
            .map_err(|_| AllocError::UnknownAllocation {
                start: allocation.start,
                size: allocation.size,
            })?;

        if self.nodes[index].size != allocation.size {
            return Err(AllocError::UnknownAllocation {
                start: allocation.start,
                size: allocation.size,
            });
        }

        self.nodes.remove(index);
        self.used -= allocation.size;
        Ok(())
    }

    /// Drop every live range
    ///
    /// Only meant for teardown, after every owner has been accounted for.
    pub fn clear(&mut self) {
        if !self.nodes.is_empty() {
            log::debug!("{}: releasing {} leftover ranges", self.name, self.nodes.len());
        }
        self.nodes.clear();
        self.used = 0;
    }
}

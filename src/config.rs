//! Tunables of the heap.
//!
//! None of these change what the allocator guarantees; they only move the
//! boundaries of its defensive checks and its search heuristics.

/// Bytes kept unusable below the top of the address space.
pub const RESERVE: usize = 0x1000;

/// Requests smaller than this re-bias the ring-head towards the carved block.
pub const SMALL_ALLOC_THRESHOLD: usize = 0x8000;

/// Requests whose `size + align` come closer than this to the end of the
/// address space are refused outright.
pub const SIZE_MARGIN: usize = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Margin excluded at the top of the address space when registering
    /// regions, so that `addr + size` never wraps in later comparisons.
    pub reserve: usize,
    /// Allocations of fewer bytes than this (header included) move the
    /// region's ring-head next to themselves, so that the next small request
    /// starts searching in the same neighbourhood. `0` disables it.
    pub small_alloc_threshold: usize,
    /// Sanity ceiling for requests, see [`SIZE_MARGIN`].
    pub size_margin: usize,
}

impl HeapConfig {
    pub const DEFAULT: HeapConfig = HeapConfig {
        reserve: RESERVE,
        small_alloc_threshold: SMALL_ALLOC_THRESHOLD,
        size_margin: SIZE_MARGIN,
    };

    /// Largest `size + align` a request may have.
    #[inline]
    pub const fn size_ceiling(&self) -> usize {
        usize::MAX - self.size_margin
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

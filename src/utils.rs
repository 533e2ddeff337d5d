//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` up using `aligment`, which must be a power of two.
///
/// This is used to move region starts to the next cell boundary and to round
/// byte counts up to whole cells. The caller guarantees the result does not
/// overflow (regions near the top of the address space are truncated before
/// we get here, see [`crate::config::HeapConfig::reserve`]).
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Whether `addr` is a multiple of `aligment`.
#[inline]
pub const fn is_aligned(addr: usize, aligment: usize) -> bool {
    addr & (aligment - 1) == 0
}

//! Heap allocator for a bootloader.
//!
//! The firmware hands over a handful of memory spans of arbitrary alignment;
//! [`Heap`] turns them into regions and serves variable-size, aligned
//! requests out of them. Every piece of bookkeeping is kept inside the
//! managed memory itself: a region record at the start of each
//! span and a one-cell header in front of every block. Free blocks of a
//! region are chained in a ring ordered by descending address, so that freed
//! neighbours can be merged back together.
//!
//! ```no_run
//! use bootmem::{Heap, HostRegion};
//!
//! let span = HostRegion::new(64 * 1024).unwrap();
//! let mut heap = Heap::new();
//! unsafe { heap.register_region(span.addr(), span.len()) };
//!
//! let ptr = heap.allocate(100, 64).unwrap();
//! unsafe { heap.deallocate(Some(ptr)) };
//! ```

mod block;
mod config;
mod error;
mod freelist;
mod global;
mod heap;
mod platform;
mod region;
mod ring;
mod trace;
mod utils;

pub use config::{HeapConfig, RESERVE, SIZE_MARGIN, SMALL_ALLOC_THRESHOLD};
pub use error::{HeapError, Result};
pub use global::LockedHeap;
pub use heap::{Heap, HeapStats};
pub use platform::{Firmware, HostRegion, Platform, page_size};
pub use trace::Traced;

/// Allocation unit of the heap in bytes. Every block, header included, is a
/// whole number of cells and every pointer handed out is cell-aligned.
pub const CELL_SIZE: usize = block::CELL;

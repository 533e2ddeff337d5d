//! Property-based tests for the heap.
//!
//! Random sequences of allocations and frees are replayed against a heap
//! backed by a single host span, checking the heap's accounting after every
//! step.

use std::ptr::NonNull;

use bootmem::{CELL_SIZE, Heap, HeapConfig, HostRegion, Platform};
use proptest::prelude::*;

const SPAN: usize = 256 * 1024;

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: usize, align_shift: u32 },
    /// Frees the live allocation at this index, modulo the live count.
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..6000, 0u32..13).prop_map(|(size, align_shift)| Op::Allocate { size, align_shift }),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

/// Fails the test on any corruption report.
struct Strict;

impl Platform for Strict {
    fn corrupted(&mut self, err: &bootmem::HeapError) {
        panic!("unexpected corruption: {err}");
    }
}

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
}

fn check(heap: &Heap<Strict>, live: &[Live]) -> Result<(), TestCaseError> {
    let mut spans: Vec<(usize, usize)> = live
        .iter()
        .map(|l| {
            let usable = unsafe { heap.usable_size(l.ptr).unwrap() };
            (l.ptr.as_ptr() as usize, usable)
        })
        .collect();

    for (l, &(addr, usable)) in live.iter().zip(&spans) {
        prop_assert!(usable >= l.size);
        prop_assert_eq!(addr % CELL_SIZE, 0);
        if l.align > 0 {
            prop_assert_eq!(addr % l.align, 0);
        }
    }

    // Headers included, no two blocks overlap.
    spans.sort();
    for pair in spans.windows(2) {
        let (low, low_usable) = pair[0];
        let (high, _) = pair[1];
        prop_assert!(low + low_usable + CELL_SIZE <= high);
    }

    // Every cell of the heap is either free or owned by exactly one block.
    let stats = heap.stats().unwrap();
    let owned: usize = spans.iter().map(|&(_, usable)| usable + CELL_SIZE).sum();
    prop_assert_eq!(stats.used_bytes(), owned);
    prop_assert!(stats.largest_free <= stats.free_bytes);

    Ok(())
}

proptest! {
    #[test]
    fn accounting_survives_any_sequence(ops in prop::collection::vec(op(), 1..120)) {
        let span = HostRegion::new(SPAN).unwrap();
        let mut heap = Heap::with_platform(Strict, HeapConfig::DEFAULT);
        unsafe { heap.register_region(span.addr(), span.len()) };
        let total = heap.stats().unwrap().total_bytes;

        let mut live: Vec<Live> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { size, align_shift } => {
                    let align = if align_shift == 0 { 0 } else { 1 << align_shift };
                    if let Some(ptr) = heap.allocate(size, align) {
                        unsafe { ptr.as_ptr().write_bytes(0xa5, size) };
                        live.push(Live { ptr, size, align });
                    }
                }
                Op::Free(index) if !live.is_empty() => {
                    let gone = live.swap_remove(index % live.len());
                    unsafe { heap.deallocate(Some(gone.ptr)) };
                }
                Op::Free(_) => {}
            }

            check(&heap, &live)?;
        }

        for gone in live.drain(..) {
            unsafe { heap.deallocate(Some(gone.ptr)) };
        }

        // Everything coalesced back into one block.
        let stats = heap.stats().unwrap();
        prop_assert_eq!(stats.free_blocks, 1);
        prop_assert_eq!(stats.free_bytes, total);
    }

    #[test]
    fn freed_block_is_handed_out_again(
        prefill in prop::collection::vec((0usize..1500, any::<bool>()), 0..40),
        size in 0usize..2000,
        align_shift in 0u32..12,
    ) {
        let span = HostRegion::new(64 * 1024).unwrap();
        let mut heap = Heap::with_platform(Strict, HeapConfig::DEFAULT);
        unsafe { heap.register_region(span.addr(), span.len()) };
        let align = 1 << align_shift;

        // Punch holes of random sizes all over the region.
        let filled: Vec<_> = prefill
            .iter()
            .filter_map(|&(len, hole)| heap.allocate(len, 0).map(|ptr| (ptr, hole)))
            .collect();
        for (ptr, hole) in filled {
            if hole {
                unsafe { heap.deallocate(Some(ptr)) };
            }
        }

        let Some(first) = heap.allocate(size, align) else {
            return Ok(());
        };
        unsafe { heap.deallocate(Some(first)) };
        let second = heap.allocate(size, align).unwrap();

        prop_assert_eq!(first, second);
    }

    #[test]
    fn array_allocate_rejects_overflow(count in 2usize.., elem in 2usize..) {
        let span = HostRegion::new(4096).unwrap();
        let mut heap = Heap::with_platform(Strict, HeapConfig::DEFAULT);
        unsafe { heap.register_region(span.addr(), span.len()) };

        let result = heap.try_array_allocate(count, elem);
        match count.checked_mul(elem) {
            None => prop_assert_eq!(result, Err(bootmem::HeapError::OutOfRange)),
            Some(_) => prop_assert!(result.is_ok() || result == Err(bootmem::HeapError::OutOfMemory)),
        }
    }
}

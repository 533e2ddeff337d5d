use std::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    ptr::{self, NonNull},
};

use crate::{
    block::CELL,
    config::HeapConfig,
    heap::Heap,
    platform::{Firmware, Platform},
};

/// A [`Heap`] that can be installed as the `#[global_allocator]` of a
/// bootloader image.
///
/// ```no_run
/// use bootmem::LockedHeap;
///
/// #[global_allocator]
/// static HEAP: LockedHeap = LockedHeap::new();
///
/// fn main() {
///     // Spans reported by the firmware memory map.
///     unsafe { HEAP.register_region(0x10_0000, 0x40_0000) };
/// }
/// ```
///
/// There is no actual lock: the boot environment runs one thread with
/// interrupts that never allocate.
pub struct LockedHeap<P: Platform = Firmware> {
    inner: UnsafeCell<Heap<P>>,
}

unsafe impl<P: Platform> Sync for LockedHeap<P> {}

impl LockedHeap<Firmware> {
    pub const fn new() -> Self {
        Self::with_platform(Firmware, HeapConfig::DEFAULT)
    }
}

impl Default for LockedHeap<Firmware> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> LockedHeap<P> {
    pub const fn with_platform(platform: P, config: HeapConfig) -> Self {
        Self {
            inner: UnsafeCell::new(Heap::with_platform(platform, config)),
        }
    }

    /// # Safety
    ///
    /// The returned reference must be the only live one.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn lock(&self) -> &mut Heap<P> {
        unsafe { &mut *self.inner.get() }
    }

    /// # Safety
    ///
    /// See [`Heap::register_region`].
    pub unsafe fn register_region(&self, addr: usize, size: usize) {
        unsafe { self.lock().register_region(addr, size) }
    }
}

unsafe impl<P: Platform> GlobalAlloc for LockedHeap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let heap = unsafe { self.lock() };
        heap.allocate(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.lock().deallocate(NonNull::new(ptr)) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let heap = unsafe { self.lock() };

        let ptr = if layout.align() <= CELL {
            heap.zeroed_allocate(layout.size())
        } else {
            heap.allocate(layout.size(), layout.align()).inspect(|ptr| unsafe {
                ptr.as_ptr().write_bytes(0, layout.size());
            })
        };

        ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let heap = unsafe { self.lock() };

        // The heap only keeps cell alignment when it moves a block.
        if layout.align() <= CELL {
            let moved = unsafe { heap.reallocate(NonNull::new(ptr), new_size) };
            return moved.map_or(ptr::null_mut(), NonNull::as_ptr);
        }

        let Some(fresh) = heap.allocate(new_size, layout.align()) else {
            return ptr::null_mut();
        };

        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), layout.size().min(new_size));
            heap.deallocate(NonNull::new(ptr));
        }

        fresh.as_ptr()
    }
}

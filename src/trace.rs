//! Call-site logging around a [`Heap`].
//!
//! Debug builds of a bootloader want to know *who* leaks or double frees.
//! Wrapping the heap in [`Traced`] logs every operation at `trace` level
//! together with the source location of its caller, and otherwise behaves
//! exactly like the heap itself.

use std::{panic::Location, ptr::NonNull};

use log::trace;

use crate::{heap::Heap, platform::Platform};

pub struct Traced<'h, P: Platform> {
    heap: &'h mut Heap<P>,
}

impl<'h, P: Platform> Traced<'h, P> {
    pub fn new(heap: &'h mut Heap<P>) -> Self {
        Self { heap }
    }

    pub fn heap(&mut self) -> &mut Heap<P> {
        self.heap
    }

    #[track_caller]
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let ptr = self.heap.allocate(size, align);
        trace!("{}: allocate({size}, {align}) = {ptr:?}", Location::caller());
        ptr
    }

    #[track_caller]
    pub fn zeroed_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.heap.zeroed_allocate(size);
        trace!("{}: zeroed_allocate({size}) = {ptr:?}", Location::caller());
        ptr
    }

    #[track_caller]
    pub fn array_allocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let ptr = self.heap.array_allocate(count, elem_size);
        trace!(
            "{}: array_allocate({count}, {elem_size}) = {ptr:?}",
            Location::caller()
        );
        ptr
    }

    /// # Safety
    ///
    /// See [`Heap::try_reallocate`].
    #[track_caller]
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let moved = unsafe { self.heap.reallocate(ptr, new_size) };
        trace!(
            "{}: reallocate({ptr:?}, {new_size}) = {moved:?}",
            Location::caller()
        );
        moved
    }

    /// # Safety
    ///
    /// See [`Heap::try_deallocate`].
    #[track_caller]
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>) {
        trace!("{}: deallocate({ptr:?})", Location::caller());
        unsafe { self.heap.deallocate(ptr) }
    }
}

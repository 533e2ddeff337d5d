use std::ptr::{self, NonNull};

use log::{info, warn};

use crate::{
    block::{BlockRef, CELL, CELL_SHIFT, Tag},
    config::HeapConfig,
    error::{HeapError, Result},
    platform::{Firmware, Platform},
    region::{Registration, RegionRef, Registry},
    utils::is_aligned,
};

/// The heap of the bootloader.
///
/// It owns a list of regions (spans of memory reported by the firmware) and
/// hands out blocks from them. Every subsystem that needs dynamic memory
/// borrows the one instance created at boot; tests simply build their own.
///
/// The plain operations ([`allocate`](Heap::allocate),
/// [`deallocate`](Heap::deallocate), ...) follow the boot contract: failures
/// come back as `None` and are recorded for [`last_error`](Heap::last_error),
/// while corruption is routed to [`Platform::corrupted`]. The `try_*`
/// variants return the [`HeapError`] instead and never call the platform's
/// corruption hook.
pub struct Heap<P: Platform = Firmware> {
    regions: Registry,
    config: HeapConfig,
    platform: P,
    error: Option<HeapError>,
}

/// Snapshot of the heap's free space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Registered regions.
    pub regions: usize,
    /// Usable bytes over all regions, headers included.
    pub total_bytes: usize,
    /// Bytes sitting in free blocks, their headers included.
    pub free_bytes: usize,
    pub free_blocks: usize,
    /// Size in bytes of the largest free block, header included.
    pub largest_free: usize,
}

impl HeapStats {
    /// Bytes taken by live allocations, their headers included.
    pub fn used_bytes(&self) -> usize {
        self.total_bytes - self.free_bytes
    }
}

impl Heap<Firmware> {
    pub const fn new() -> Self {
        Self::with_platform(Firmware, HeapConfig::DEFAULT)
    }
}

impl Default for Heap<Firmware> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Heap<P> {
    pub const fn with_platform(platform: P, config: HeapConfig) -> Self {
        Self {
            regions: Registry::new(),
            config,
            platform,
            error: None,
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Last recoverable failure recorded by one of the `Option` returning
    /// operations. It stays until [`take_error`](Heap::take_error).
    pub fn last_error(&self) -> Option<HeapError> {
        self.error
    }

    pub fn take_error(&mut self) -> Option<HeapError> {
        self.error.take()
    }

    /// Makes `size` bytes starting at `addr` available for allocation.
    ///
    /// Nothing is reported back: a span that is too small or lies in the
    /// reserved top of the address space is dropped with a warning.
    ///
    /// # Safety
    ///
    /// The span must be writable memory that nothing else uses for as long
    /// as this heap is in use.
    pub unsafe fn register_region(&mut self, addr: usize, size: usize) {
        let result = unsafe { self.regions.register(addr, size, &self.config) };

        if let Some(Registration::Discarded) = self.settle(result) {
            warn!("memory at {addr:#x}+{size:#x} is not usable by the heap");
        }
    }

    /// Returns `size` bytes aligned to `align`, which is zero or a power of
    /// two. Zero-sized requests still get a distinct, freeable pointer.
    pub fn try_allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if align != 0 && !align.is_power_of_two() {
            return Err(HeapError::BadAlignment(align));
        }

        if size > usize::MAX - align || size + align > self.config.size_ceiling() {
            return Err(HeapError::OutOfMemory);
        }

        let n = size.div_ceil(CELL) + 1;
        let align = (align >> CELL_SHIFT).max(1);

        if let Some(block) = self.search(n, align)? {
            return Ok(block.body());
        }

        warn!("out of memory for {size} bytes, dropping the disk cache");
        self.platform.invalidate_disk_cache();

        match self.search(n, align)? {
            Some(block) => Ok(block.body()),
            None => Err(HeapError::OutOfMemory),
        }
    }

    fn search(&self, n: usize, align: usize) -> Result<Option<BlockRef>> {
        for region in self.regions.iter() {
            if let Some(block) = region.carve(n, align, &self.config)? {
                return Ok(Some(block));
            }
        }

        Ok(None)
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let result = self.try_allocate(size, align);
        self.settle(result)
    }

    pub fn try_zeroed_allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.try_allocate(size, 0)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    pub fn zeroed_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let result = self.try_zeroed_allocate(size);
        self.settle(result)
    }

    /// Zeroed room for `count` elements of `elem_size` bytes. Fails with
    /// [`HeapError::OutOfRange`] before touching the heap when the total
    /// does not fit in a `usize`.
    pub fn try_array_allocate(&mut self, count: usize, elem_size: usize) -> Result<NonNull<u8>> {
        let size = count.checked_mul(elem_size).ok_or(HeapError::OutOfRange)?;
        self.try_zeroed_allocate(size)
    }

    pub fn array_allocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let result = self.try_array_allocate(count, elem_size);
        self.settle(result)
    }

    /// Gives the block holding `ptr` back to its region.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call. Pointers that were not
    /// returned by this heap are detected as long as they are cell-aligned or
    /// outside every region; anything else reads whatever precedes them.
    pub unsafe fn try_deallocate(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let (region, block) = self.lookup(ptr)?;
        region.reinsert(block)
    }

    /// # Safety
    ///
    /// See [`try_deallocate`](Heap::try_deallocate).
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };

        let result = unsafe { self.try_deallocate(ptr) };
        self.settle(result);
    }

    /// Resizes the allocation at `ptr`.
    ///
    /// A null `ptr` allocates, a zero `new_size` frees and returns `None`.
    /// Blocks that are already large enough are returned as they are;
    /// otherwise the content moves to a fresh block.
    ///
    /// # Safety
    ///
    /// See [`try_deallocate`](Heap::try_deallocate); on a move the old
    /// pointer is dead.
    pub unsafe fn try_reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(ptr) = ptr else {
            return self.try_allocate(new_size, 0).map(Some);
        };

        if new_size == 0 {
            unsafe { self.try_deallocate(ptr)? };
            return Ok(None);
        }

        let (_, block) = self.lookup(ptr)?;

        if block.size() >= new_size.div_ceil(CELL) + 1 {
            return Ok(Some(ptr));
        }

        let fresh = self.try_allocate(new_size, 0)?;

        unsafe {
            ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                fresh.as_ptr(),
                (block.size() - 1) << CELL_SHIFT,
            );
            self.try_deallocate(ptr)?;
        }

        Ok(Some(fresh))
    }

    /// # Safety
    ///
    /// See [`try_reallocate`](Heap::try_reallocate).
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let result = unsafe { self.try_reallocate(ptr, new_size) };
        self.settle(result).flatten()
    }

    /// Bytes usable behind `ptr`, which may exceed what was asked for.
    ///
    /// # Safety
    ///
    /// See [`try_deallocate`](Heap::try_deallocate).
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let (_, block) = self.lookup(ptr)?;
        Ok((block.size() - 1) << CELL_SHIFT)
    }

    /// Region and header of the live allocation `ptr`.
    fn lookup(&self, ptr: NonNull<u8>) -> Result<(RegionRef, BlockRef)> {
        let addr = ptr.as_ptr() as usize;

        if !is_aligned(addr, CELL) {
            return Err(HeapError::UnalignedPointer(addr));
        }

        let region = self
            .regions
            .owner(addr)
            .ok_or(HeapError::ForeignPointer(addr))?;

        let block = unsafe { BlockRef::from_body(ptr) };

        if block.is(Tag::Free) {
            return Err(HeapError::DoubleFree(addr));
        }

        let room = (region.addr() + region.size() - block.addr()) >> CELL_SHIFT;

        if !block.is(Tag::Allocated) || block.size() == 0 || block.size() > room {
            return Err(HeapError::BrokenAllocMagic {
                addr: block.addr(),
                magic: block.magic(),
            });
        }

        Ok((region, block))
    }

    /// Walks every region and ring.
    pub fn stats(&self) -> Result<HeapStats> {
        let mut stats = HeapStats::default();

        for region in self.regions.iter() {
            stats.regions += 1;
            stats.total_bytes += region.size();

            for block in region.free_blocks() {
                let bytes = block?.size() << CELL_SHIFT;
                stats.free_blocks += 1;
                stats.free_bytes += bytes;
                stats.largest_free = stats.largest_free.max(bytes);
            }
        }

        Ok(stats)
    }

    /// Logs every region and its free blocks.
    pub fn dump(&self) -> Result<()> {
        for region in self.regions.iter() {
            info!(
                "region {:#x}: {:#x} bytes at {:#x}, pre-size {:#x}{}",
                region.record(),
                region.size(),
                region.addr(),
                region.pre_size(),
                if region.is_full() { ", full" } else { "" }
            );

            for block in region.free_blocks() {
                let block = block?;
                info!("  free {:#x}: {} cells", block.addr(), block.size());
            }
        }

        Ok(())
    }

    /// Applies the boot-time failure policy to `result`.
    fn settle<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                if err.is_fatal() {
                    self.platform.corrupted(&err);
                }
                self.error = Some(err);
                None
            }
        }
    }
}

use std::{fmt, mem, ptr::NonNull};

use log::debug;

use crate::{
    block::{BlockRef, CELL, CELL_SHIFT, Tag},
    config::HeapConfig,
    error::Result,
    utils::align,
};

/// This is the overhead introduced by the [`Region`] record in bytes,
/// rounded up to whole cells so the first block header stays cell-aligned.
pub(crate) const REGION_HEADER_SIZE: usize = align(mem::size_of::<Region>(), CELL);

/// Record describing one contiguous span of memory handed to the heap.
///
/// The record is stored in place, at the first cell boundary of the span it
/// describes, and the usable space starts right after it:
///
/// ```text
///   span start                                                   span end
///   |<- pre_size ->|                                                    |
///   +--------------+--------+-------------------------------------------+
///   |   slack      | Region |  blocks ... (size bytes, starting at addr)|
///   +--------------+--------+-------------------------------------------+
///                  ^ record ^ addr
/// ```
///
/// Regions are linked in a singly linked list, smaller regions first, so
/// that large regions stay whole for large requests.
#[repr(C)]
pub(crate) struct Region {
    /// Ring-head: some member of the free ring, or the last allocated block
    /// when the region is full.
    first: BlockRef,
    next: *mut Region,
    /// Bytes between the span start and this record.
    pre_size: usize,
    /// Usable bytes, always a whole number of cells.
    size: usize,
    /// First usable byte (header of the lowest block).
    addr: usize,
}

/// Handle to an in-place [`Region`] record.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionRef(NonNull<Region>);

impl RegionRef {
    /// # Safety
    ///
    /// `record` must be cell-aligned and `REGION_HEADER_SIZE` writable bytes
    /// owned by the heap.
    unsafe fn write(record: usize, region: Region) -> Self {
        let ptr = record as *mut Region;
        unsafe {
            ptr.write(region);
            Self(NonNull::new_unchecked(ptr))
        }
    }

    /// Moves the record down to `record`, which may overlap the old one.
    ///
    /// # Safety
    ///
    /// Same as [`RegionRef::write`].
    unsafe fn relocate(self, record: usize) -> Self {
        let ptr = record as *mut Region;
        unsafe {
            std::ptr::copy(self.0.as_ptr(), ptr, 1);
            Self(NonNull::new_unchecked(ptr))
        }
    }

    #[inline]
    pub fn record(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn first(self) -> BlockRef {
        unsafe { (*self.0.as_ptr()).first }
    }

    #[inline]
    pub fn set_first(self, block: BlockRef) {
        unsafe { (*self.0.as_ptr()).first = block }
    }

    #[inline]
    pub fn next(self) -> Option<RegionRef> {
        unsafe { NonNull::new((*self.0.as_ptr()).next).map(RegionRef) }
    }

    #[inline]
    fn set_next(self, next: Option<RegionRef>) {
        let next = next.map_or(std::ptr::null_mut(), |r| r.0.as_ptr());
        unsafe { (*self.0.as_ptr()).next = next }
    }

    #[inline]
    pub fn pre_size(self) -> usize {
        unsafe { (*self.0.as_ptr()).pre_size }
    }

    #[inline]
    fn set_pre_size(self, pre_size: usize) {
        unsafe { (*self.0.as_ptr()).pre_size = pre_size }
    }

    #[inline]
    pub fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    #[inline]
    fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    #[inline]
    pub fn addr(self) -> usize {
        unsafe { (*self.0.as_ptr()).addr }
    }

    #[inline]
    fn set_addr(self, addr: usize) {
        unsafe { (*self.0.as_ptr()).addr = addr }
    }

    /// First byte of the span this region was built from.
    #[inline]
    pub fn span_start(self) -> usize {
        self.record() - self.pre_size()
    }

    /// Whether `ptr` can be the body of a block of this region. A one-cell
    /// block at the top has its body right at the end of the region.
    #[inline]
    pub fn holds_body(self, ptr: usize) -> bool {
        ptr >= self.addr() + CELL && ptr - self.addr() <= self.size()
    }

    /// Whether the region has no free block left.
    #[inline]
    pub fn is_full(self) -> bool {
        self.first().is(Tag::Allocated)
    }
}

impl fmt::Debug for RegionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("record", &format_args!("{:#x}", self.record()))
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("size", &self.size())
            .field("pre_size", &self.pre_size())
            .finish()
    }
}

/// What [`Registry::register`] did with a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The span could not hold anything and was dropped.
    Discarded,
    /// A new region was linked in.
    Created(RegionRef),
    /// The span was absorbed by an existing region.
    Merged(RegionRef),
}

/// List of every region available for allocation.
pub(crate) struct Registry {
    base: Option<RegionRef>,
}

pub(crate) struct Regions {
    current: Option<RegionRef>,
}

impl Iterator for Regions {
    type Item = RegionRef;

    fn next(&mut self) -> Option<Self::Item> {
        let region = self.current?;
        self.current = region.next();
        Some(region)
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self { base: None }
    }

    pub fn iter(&self) -> Regions {
        Regions { current: self.base }
    }

    /// Region that may have handed out the body pointer `ptr`.
    pub fn owner(&self, ptr: usize) -> Option<RegionRef> {
        self.iter().find(|region| region.holds_body(ptr))
    }

    /// Hands `size` bytes starting at `addr` to the heap.
    ///
    /// The span is either glued to the front of an existing region it ends
    /// right before, or becomes a new region holding a single free block.
    /// Spans that cannot hold a record plus one cell are dropped.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be writable memory that nothing else uses,
    /// for as long as the heap lives.
    pub unsafe fn register(
        &mut self,
        addr: usize,
        mut size: usize,
        config: &HeapConfig,
    ) -> Result<Registration> {
        // If `addr + reserve` overflows the whole span is in the excluded zone.
        if addr > usize::MAX - config.reserve {
            debug!("region {addr:#x}+{size:#x} lies in the reserved top of memory, dropped");
            return Ok(Registration::Discarded);
        }

        // If `addr + reserve + size` overflows, cut the span short.
        if addr + config.reserve > usize::MAX - size {
            size = usize::MAX - config.reserve - addr + 1;
            debug!("region at {addr:#x} truncated to {size:#x} bytes");
        }

        if let Some(region) = unsafe { self.merge(addr, size)? } {
            return Ok(Registration::Merged(region));
        }

        let record = align(addr, CELL);

        if size < CELL + (record - addr) + REGION_HEADER_SIZE {
            debug!("region {addr:#x}+{size:#x} too small, dropped");
            return Ok(Registration::Discarded);
        }

        let usable = size - (record - addr) - REGION_HEADER_SIZE;
        let cells = usable >> CELL_SHIFT;
        let start = record + REGION_HEADER_SIZE;

        let block = unsafe { BlockRef::at(start) };
        block.init(Tag::Free, cells, block);

        let region = unsafe {
            RegionRef::write(
                record,
                Region {
                    first: block,
                    next: std::ptr::null_mut(),
                    pre_size: record - addr,
                    size: cells << CELL_SHIFT,
                    addr: start,
                },
            )
        };

        self.insert_by_size(region);

        debug!("registered {region:?}");

        Ok(Registration::Created(region))
    }

    /// Absorbs `[addr, addr + size)` into the region whose span starts right
    /// where it ends, if there is one.
    ///
    /// The record moves down to the first cell boundary of the new span, the
    /// whole cells this frees up become an allocated block, and that block is
    /// immediately released into the region's ring. What is left below the
    /// record is less than a cell and becomes the new pre-size.
    unsafe fn merge(&mut self, addr: usize, size: usize) -> Result<Option<RegionRef>> {
        let mut prev: Option<RegionRef> = None;

        for region in self.iter() {
            if addr + size != region.span_start() {
                prev = Some(region);
                continue;
            }

            let record = align(addr, CELL);
            let gained = region.record() - record;

            if gained == 0 {
                region.set_pre_size(region.pre_size() + size);
                debug!("absorbed {size:#x} bytes as pre-size of {region:?}");
                return Ok(Some(region));
            }

            let moved = unsafe { region.relocate(record) };
            match prev {
                Some(prev) => prev.set_next(Some(moved)),
                None => self.base = Some(moved),
            }

            let start = record + REGION_HEADER_SIZE;
            let block = unsafe { BlockRef::at(start) };
            block.init(Tag::Allocated, gained >> CELL_SHIFT, block);

            moved.set_pre_size(record - addr);
            moved.set_addr(start);
            moved.set_size(moved.size() + gained);

            moved.reinsert(block)?;

            debug!(
                "merged {} cells from {addr:#x} into {moved:?}",
                gained >> CELL_SHIFT
            );

            return Ok(Some(moved));
        }

        Ok(None)
    }

    /// Links `region` before the first region larger than it.
    fn insert_by_size(&mut self, region: RegionRef) {
        let mut prev: Option<RegionRef> = None;
        let mut current = self.base;

        while let Some(q) = current {
            if q.size() > region.size() {
                break;
            }
            prev = current;
            current = q.next();
        }

        region.set_next(current);
        match prev {
            Some(prev) => prev.set_next(Some(region)),
            None => self.base = Some(region),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostRegion;

    fn registry_over(span: &HostRegion, parts: &[(usize, usize)]) -> Registry {
        let mut registry = Registry::new();
        for &(offset, len) in parts {
            unsafe {
                registry
                    .register(span.addr() + offset, len, &HeapConfig::DEFAULT)
                    .unwrap();
            }
        }
        registry
    }

    #[test]
    fn new_region_is_one_free_block() {
        let span = HostRegion::new(4096).unwrap();
        let registry = registry_over(&span, &[(0, 4096)]);

        let region = registry.iter().next().unwrap();
        let first = region.first();

        assert_eq!(region.record(), span.addr());
        assert_eq!(region.pre_size(), 0);
        assert_eq!(region.addr(), span.addr() + REGION_HEADER_SIZE);
        assert_eq!(region.size(), 4096 - REGION_HEADER_SIZE);
        assert_eq!(first.addr(), region.addr());
        assert_eq!(first.size() << CELL_SHIFT, region.size());
        assert_eq!(first.next(), first);
        assert!(first.is(Tag::Free));
    }

    #[test]
    fn unaligned_start_is_kept_as_pre_size() {
        let span = HostRegion::new(4096).unwrap();
        let registry = registry_over(&span, &[(3, 4000)]);

        let region = registry.iter().next().unwrap();

        assert_eq!(region.record(), span.addr() + CELL);
        assert_eq!(region.pre_size(), CELL - 3);
        assert_eq!(region.size() % CELL, 0);
        assert!(region.size() <= 4000 - (CELL - 3) - REGION_HEADER_SIZE);
    }

    #[test]
    fn tiny_region_is_dropped() {
        let span = HostRegion::new(4096).unwrap();
        let mut registry = Registry::new();

        let outcome = unsafe {
            registry
                .register(span.addr(), REGION_HEADER_SIZE, &HeapConfig::DEFAULT)
                .unwrap()
        };

        assert_eq!(outcome, Registration::Discarded);
        assert!(registry.iter().next().is_none());
    }

    #[test]
    fn region_in_reserved_top_is_dropped() {
        let mut registry = Registry::new();

        let outcome = unsafe {
            registry
                .register(usize::MAX - 0x800, 0x400, &HeapConfig::DEFAULT)
                .unwrap()
        };

        assert_eq!(outcome, Registration::Discarded);
        assert!(registry.iter().next().is_none());
    }

    #[test]
    fn regions_are_ordered_by_size() {
        let span = HostRegion::new(3 * 4096).unwrap();
        // Leave gaps so nothing merges.
        let registry = registry_over(&span, &[(0, 2048), (4096, 4096), (2 * 4096 + 512, 1024)]);

        let sizes: Vec<_> = registry.iter().map(|r| r.size()).collect();
        let mut sorted = sizes.clone();
        sorted.sort();

        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes, sorted);
    }

    #[test]
    fn span_ending_at_a_region_is_merged() {
        let span = HostRegion::new(2 * 4096).unwrap();
        let registry = registry_over(&span, &[(4096, 4096), (0, 4096)]);

        let regions: Vec<_> = registry.iter().collect();
        assert_eq!(regions.len(), 1);

        let region = regions[0];
        assert_eq!(region.record(), span.addr());
        assert_eq!(region.pre_size(), 0);
        assert_eq!(region.addr(), span.addr() + REGION_HEADER_SIZE);
        assert_eq!(region.size(), 2 * 4096 - REGION_HEADER_SIZE);

        // The released block coalesced with the original one.
        let first = region.first();
        assert_eq!(first.next(), first);
        assert_eq!(first.addr(), region.addr());
        assert_eq!(first.size() << CELL_SHIFT, region.size());
    }

    #[test]
    fn sub_cell_span_only_grows_pre_size() {
        let span = HostRegion::new(4096).unwrap();
        let registry = registry_over(&span, &[(CELL + 5, 2048), (CELL + 1, 4)]);

        let regions: Vec<_> = registry.iter().collect();
        assert_eq!(regions.len(), 1);

        let region = regions[0];
        assert_eq!(region.record(), span.addr() + 2 * CELL);
        assert_eq!(region.pre_size(), CELL - 1);
        assert_eq!(region.span_start(), span.addr() + CELL + 1);
    }

    #[test]
    fn owner_finds_the_containing_region() {
        let span = HostRegion::new(3 * 4096).unwrap();
        let registry = registry_over(&span, &[(0, 4096), (2 * 4096, 4096)]);

        let low = registry.owner(span.addr() + REGION_HEADER_SIZE + CELL).unwrap();
        let high = registry
            .owner(span.addr() + 2 * 4096 + REGION_HEADER_SIZE + CELL)
            .unwrap();

        assert_eq!(low.record(), span.addr());
        assert_eq!(high.record(), span.addr() + 2 * 4096);
        assert!(registry.owner(span.addr() + 4096 + 8).is_none());
    }

    #[test]
    fn owner_accepts_a_body_at_the_region_end() {
        let span = HostRegion::new(4096).unwrap();
        let registry = registry_over(&span, &[(0, 4096)]);
        let region = registry.iter().next().unwrap();
        let end = region.addr() + region.size();

        assert_eq!(registry.owner(end), Some(region));
        assert!(registry.owner(end + CELL).is_none());
        // The first cell always holds a header.
        assert!(registry.owner(region.addr()).is_none());
    }
}

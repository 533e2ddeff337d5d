use std::{fmt, mem, ptr::NonNull};

/// Accounting unit of the heap. Every size and alignment is expressed in
/// cells internally, and one header always fits exactly in the cell right
/// before the bytes handed to a caller.
pub(crate) const CELL: usize = mem::size_of::<Block>();

/// `log2(CELL)`.
pub(crate) const CELL_SHIFT: u32 = CELL.trailing_zeros();

const _: () = assert!(CELL.is_power_of_two());
const _: () = assert!(mem::size_of::<Block>() == mem::align_of::<Block>());

/// Tag of a block sitting in a free ring.
pub(crate) const FREE_MAGIC: usize = 0x2d3c_2808;
/// Tag of a block owned by a caller.
pub(crate) const ALLOC_MAGIC: usize = 0x6db0_8fa4;
/// Tag left behind on a header that was absorbed by coalescing.
pub(crate) const INERT_MAGIC: usize = 0;

/// This is the in-place control word of every block, free or allocated.
/// Content is placed right after this header.
///
/// ```text
/// +---------------------+ <------+
/// |   next (free only)  |        |
/// +---------------------+        |
/// |        magic        |        | -> Header (exactly one cell)
/// +---------------------+        |
/// |   size (in cells)   |        |
/// +---------------------+ <------+
/// |       Content       |        |
/// |         ...         |        | -> size - 1 cells handed to the caller
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// `size` counts the header cell too, so a block of `n` cells spans
/// `n * CELL` bytes starting at the header. The alignment attribute pads the
/// record to a power of two so that it can double as the cell size.
#[repr(C)]
#[cfg_attr(target_pointer_width = "64", repr(align(32)))]
#[cfg_attr(not(target_pointer_width = "64"), repr(align(16)))]
pub(crate) struct Block {
    next: *mut Block,
    magic: usize,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    Free,
    Allocated,
    Inert,
}

impl Tag {
    const fn magic(self) -> usize {
        match self {
            Tag::Free => FREE_MAGIC,
            Tag::Allocated => ALLOC_MAGIC,
            Tag::Inert => INERT_MAGIC,
        }
    }
}

/// Handle to a [`Block`] header living inside a registered region.
///
/// This is the one place the heap dereferences raw block memory. A `BlockRef`
/// can only be made through the `unsafe` constructors below, whose callers
/// promise that the address is a cell-aligned header inside memory that was
/// handed to [`crate::Heap::register_region`]. Once that promise is made the
/// accessors are safe to call.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockRef(NonNull<Block>);

impl BlockRef {
    /// # Safety
    ///
    /// `addr` must be non-null, cell-aligned and point at `CELL` writable
    /// bytes owned by the heap.
    #[inline]
    pub unsafe fn at(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr % CELL == 0);
        unsafe { Self(NonNull::new_unchecked(addr as *mut Block)) }
    }

    /// Header of the block whose content starts at `body`.
    ///
    /// # Safety
    ///
    /// Same as [`BlockRef::at`] for `body - CELL`.
    #[inline]
    pub unsafe fn from_body(body: NonNull<u8>) -> Self {
        unsafe { Self::at(body.as_ptr() as usize - CELL) }
    }

    /// Writes a whole header.
    #[inline]
    pub fn init(self, tag: Tag, size: usize, next: BlockRef) {
        unsafe {
            self.0.as_ptr().write(Block {
                next: next.0.as_ptr(),
                magic: tag.magic(),
                size,
            });
        }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// First byte after the header.
    #[inline]
    pub fn body(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(1).cast()) }
    }

    /// First byte after the whole block.
    #[inline]
    pub fn end(self) -> usize {
        self.addr() + (self.size() << CELL_SHIFT)
    }

    /// The header `cells` cells further up. Callers only step inside the
    /// span of the block they started from.
    #[inline]
    pub fn add(self, cells: usize) -> BlockRef {
        unsafe { BlockRef(NonNull::new_unchecked(self.0.as_ptr().add(cells))) }
    }

    #[inline]
    pub fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    #[inline]
    pub fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    #[inline]
    pub fn next(self) -> BlockRef {
        unsafe { BlockRef(NonNull::new_unchecked((*self.0.as_ptr()).next)) }
    }

    #[inline]
    pub fn set_next(self, next: BlockRef) {
        unsafe { (*self.0.as_ptr()).next = next.0.as_ptr() }
    }

    #[inline]
    pub fn magic(self) -> usize {
        unsafe { (*self.0.as_ptr()).magic }
    }

    #[inline]
    pub fn is(self, tag: Tag) -> bool {
        self.magic() == tag.magic()
    }

    #[inline]
    pub fn set_tag(self, tag: Tag) {
        unsafe { (*self.0.as_ptr()).magic = tag.magic() }
    }

    /// Whether the ring link is non-null. Only meaningful on free blocks.
    #[inline]
    pub fn has_next(self) -> bool {
        unsafe { !(*self.0.as_ptr()).next.is_null() }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block@{:#x}", self.addr())
    }
}

use thiserror::Error;

/// Everything that can go wrong inside the heap.
///
/// The variants fall into two groups. Exhaustion errors (`OutOfMemory`,
/// `OutOfRange`, `BadAlignment`) are ordinary failures: the heap is intact and
/// the caller may try again later. Every other variant means the heap's
/// invariants were already broken by the time we looked, and the only sane
/// reaction at boot time is to stop. See [`HeapError::is_fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("overflow is detected")]
    OutOfRange,

    #[error("alignment {0:#x} is not a power of two")]
    BadAlignment(usize),

    #[error("unaligned pointer {0:#x}")]
    UnalignedPointer(usize),

    #[error("out of range pointer {0:#x}")]
    ForeignPointer(usize),

    #[error("double free at {0:#x}")]
    DoubleFree(usize),

    #[error("alloc magic is broken at {addr:#x}: {magic:#x}")]
    BrokenAllocMagic { addr: usize, magic: usize },

    #[error("free magic is broken at {addr:#x}: {magic:#x}")]
    BrokenFreeMagic { addr: usize, magic: usize },

    #[error("free ring of region at {0:#x} does not close")]
    BrokenRing(usize),
}

impl HeapError {
    /// Whether this error reports heap corruption rather than exhaustion.
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            HeapError::OutOfMemory | HeapError::OutOfRange | HeapError::BadAlignment(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, HeapError>;

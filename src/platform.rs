//! Everything the heap needs from the world around it.
//!
//! At boot there is exactly one caller of the heap and nobody to report to,
//! so the outward surface is small: a nudge to the disk cache when memory
//! runs out, and a last word when the heap finds itself corrupted. The
//! [`Platform`] trait carries both.
//!
//! [`HostRegion`] is the hosted stand-in for a firmware memory descriptor: an
//! anonymous mapping obtained from the operating system, used by the demos
//! and the tests to get spans to register.

use std::ptr::NonNull;

use log::error;

use crate::{error::HeapError, utils::align};

/// Collaborators the heap calls outwards.
pub trait Platform {
    /// Drops every cached disk sector. Called once when a request cannot be
    /// satisfied, before the search is retried.
    fn invalidate_disk_cache(&mut self) {}

    /// Called when an operation finds the heap corrupted (see
    /// [`HeapError::is_fatal`]). The default implementation stops the program;
    /// an implementation that returns makes the failing operation return
    /// without touching the heap any further.
    fn corrupted(&mut self, err: &HeapError) {
        error!("heap corrupted: {err}");
        panic!("heap corrupted: {err}");
    }
}

/// Bare environment: no disk cache to drop, corruption halts.
#[derive(Debug, Default, Clone, Copy)]
pub struct Firmware;

impl Platform for Firmware {}

impl<P: Platform + ?Sized> Platform for &mut P {
    fn invalidate_disk_cache(&mut self) {
        (**self).invalidate_disk_cache()
    }

    fn corrupted(&mut self, err: &HeapError) {
        (**self).corrupted(err)
    }
}

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls of the host we run on when there is no firmware.
trait HostMemory {
    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// A page-aligned span of host memory, unmapped on drop.
///
/// A heap that had this span registered must not be used after the span is
/// dropped.
#[derive(Debug)]
pub struct HostRegion {
    addr: NonNull<u8>,
    len: usize,
    mapped: usize,
}

impl HostRegion {
    /// Maps at least `len` bytes of zeroed, writable memory.
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }

        let mapped = align(len, page_size());
        let addr = unsafe { HostRegion::request_memory(mapped)? };

        Some(Self { addr, len, mapped })
    }

    /// First byte of the span.
    #[inline]
    pub fn addr(&self) -> usize {
        self.addr.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Bytes requested in [`HostRegion::new`].
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        unsafe { HostRegion::return_memory(self.addr.as_ptr(), self.mapped) }
    }
}

/// Host page size.
pub fn page_size() -> usize {
    unsafe { HostRegion::page_size() }
}

#[cfg(unix)]
mod unix {
    use super::{HostMemory, HostRegion};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{os::raw::{c_int, c_void}, ptr::NonNull};

    impl HostMemory for HostRegion {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{HostMemory, HostRegion};

    use windows::Win32::System::{Memory, SystemInformation};

    impl HostMemory for HostRegion {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_region_is_page_aligned_and_writable() {
        let span = HostRegion::new(3000).unwrap();

        assert_eq!(span.len(), 3000);
        assert_eq!(span.addr() % page_size(), 0);

        unsafe {
            span.as_ptr().write_bytes(0xa5, span.len());
            assert_eq!(*span.as_ptr().add(2999), 0xa5);
        }
    }

    #[test]
    fn empty_host_region_is_refused() {
        assert!(HostRegion::new(0).is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn firmware_halts_on_corruption() {
        Firmware.corrupted(&HeapError::DoubleFree(0x1000));
    }
}

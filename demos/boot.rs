//! Plays the part of early boot: the "firmware" reports a few memory spans,
//! the heap takes them over and a couple of subsystems allocate from it.
//!
//! Run with `RUST_LOG`-style verbosity baked in: everything at `debug` and
//! above is printed.

use std::{ffi::CStr, ptr::NonNull};

use bootmem::{Heap, HostRegion};
use log::LevelFilter;
use simple_logger::SimpleLogger;

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Debug)
        .init()
        .unwrap();

    // Our pretend physical memory.
    let memory = HostRegion::new(64 * 4096).unwrap();
    let base = memory.addr();

    // Firmware memory map: unaligned, out of order, one entry right below
    // another and one too small to be of any use.
    let map = [
        (base + 16 * 4096, 32 * 4096),
        (base + 3, 12 * 4096 - 3),
        (base + 8 * 4096 + 0x800, 0x10),
        (base + 48 * 4096, 8 * 4096),
        (base + 40 * 4096, 8 * 4096),
    ];

    let mut heap = Heap::new();
    for (addr, size) in map {
        unsafe { heap.register_region(addr, size) };
    }

    println!("after registration: {:?}", heap.stats().unwrap());

    // Command line handed over by the previous stage.
    let line = b"root=/dev/sda1 quiet\0";
    let cmdline = heap.allocate(line.len(), 0).unwrap();
    unsafe { cmdline.as_ptr().copy_from(line.as_ptr(), line.len()) };
    let cmdline_str = unsafe { CStr::from_ptr(cmdline.as_ptr().cast()) };
    println!("cmdline at {cmdline:?}: {cmdline_str:?}");

    // Page tables want page alignment.
    let table = heap.zeroed_allocate(4096).unwrap();
    let pml4 = heap.allocate(4096, 4096).unwrap();
    println!("page table at {pml4:?} (zeroed scratch at {table:?})");

    // Module list that grows as modules are found.
    let mut modules: Option<NonNull<u8>> = None;
    for count in 1..=16 {
        modules = unsafe { heap.reallocate(modules, count * 64) };
        assert!(modules.is_some());
    }
    println!("module list at {modules:?}");

    // A request no region can satisfy.
    if heap.allocate(1 << 30, 0).is_none() {
        println!("1 GiB request failed: {:?}", heap.take_error());
    }

    unsafe {
        heap.deallocate(modules);
        heap.deallocate(Some(pml4));
        heap.deallocate(Some(table));
        heap.deallocate(Some(cmdline));
    }

    println!("after boot: {:?}", heap.stats().unwrap());

    log::set_max_level(LevelFilter::Info);
    heap.dump().unwrap();
}

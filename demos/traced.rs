//! Finds a leak by tracing every heap call with its call site.

use bootmem::{Heap, HostRegion, Traced};
use log::LevelFilter;
use simple_logger::SimpleLogger;

fn load_module(heap: &mut Traced<'_, bootmem::Firmware>, name: &str) {
    let image = heap.allocate(4000, 4096).unwrap();
    let name_buf = heap.zeroed_allocate(name.len() + 1).unwrap();

    // Oops: `name_buf` is never given back.
    unsafe { heap.deallocate(Some(image)) };
    let _ = name_buf;
}

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Trace)
        .init()
        .unwrap();

    let memory = HostRegion::new(16 * 4096).unwrap();
    let mut heap = Heap::new();
    unsafe { heap.register_region(memory.addr(), memory.len()) };

    {
        let mut traced = Traced::new(&mut heap);
        for name in ["ext2", "part_gpt", "normal"] {
            load_module(&mut traced, name);
        }
    }

    let stats = heap.stats().unwrap();
    println!(
        "{} bytes still in use, look for zeroed_allocate in the trace above",
        stats.used_bytes()
    );
}

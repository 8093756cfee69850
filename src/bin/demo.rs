//! Demonstration harness for the two-tier allocator.
//!
//! Reserves a 1 GiB region from the host allocator, mounts the buddy
//! allocator on it and drives a bank of slab caches the way a kernel heap
//! would, printing a handful of allocations and the allocator report.

use hearth::buddy::{BuddyAllocator, SharedBuddy, LARGEST_ALLOWED_ORDER};
use hearth::heap::CACHE_SIZES;
use hearth::slab::SlabCache;
use hearth::{unit, PAGE_SIZE};
use owo_colors::OwoColorize;
use spin::Mutex;
use std::alloc::{alloc, Layout};
use std::ptr::NonNull;

static VM_BUDDY: Mutex<BuddyAllocator> = Mutex::new(BuddyAllocator::new());

struct Logger;

static LOGGER: Logger = Logger;

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let mod_path = record.module_path().unwrap_or("<n/a>");
            println!("[ {:>5} ] [{}] {}", record.level(), mod_path, record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging() {
    log::set_logger(&LOGGER).expect("failed to init logging");
    log::set_max_level(log::LevelFilter::Debug);
}

fn main() {
    init_logging();

    // the host allocator plays the role of the physical memory map
    let heap_size = 1usize << LARGEST_ALLOWED_ORDER;
    let layout = Layout::from_size_align(heap_size, PAGE_SIZE).unwrap();
    let mem_base =
        NonNull::new(unsafe { alloc(layout) }).expect("failed to reserve the demo heap");

    unsafe { VM_BUDDY.lock().init(mem_base, LARGEST_ALLOWED_ORDER) };
    log::info!(
        "{} the two-tier heap with {} of memory",
        "Initialized".green(),
        unit::bytes(heap_size)
    );

    let backing = SharedBuddy::new(&VM_BUDDY);
    let mut caches: [SlabCache<SharedBuddy<'_>>; CACHE_SIZES.len()] =
        core::array::from_fn(|_| SlabCache::new(backing));
    for (cache, size) in caches.iter_mut().zip(CACHE_SIZES) {
        cache.initialize(size, "heap");
    }

    for _ in 0..5 {
        let object = caches[0].allocate().expect("heap is OOM");
        println!("{:p}", object);
    }

    println!("{}", VM_BUDDY.lock().stats());

    // the region is leaked on purpose; the host reclaims it on exit
}

//! A size-class heap built from both tiers.
//!
//! [`Heap`] is the combination the demo and a kernel would actually mount:
//! nine slab caches for objects of 8 bytes up to one page, all backed by
//! one shared buddy allocator, with anything larger than a page going to
//! the buddy directly.

use crate::buddy::{self, BuddyAllocator, FillMode, SharedBuddy};
use crate::slab::SlabCache;
use crate::Result;
use core::ptr::NonNull;
use spin::Mutex;

type Cache<'buddy> = SlabCache<SharedBuddy<'buddy>>;

/// The object sizes served by the slab tier of a [`Heap`].
pub const CACHE_SIZES: [usize; 9] = [8, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// A two-tier heap: slab caches in front, one buddy allocator behind them.
pub struct Heap<'buddy> {
    cache_8: Cache<'buddy>,
    cache_32: Cache<'buddy>,
    cache_64: Cache<'buddy>,
    cache_128: Cache<'buddy>,
    cache_256: Cache<'buddy>,
    cache_512: Cache<'buddy>,
    cache_1024: Cache<'buddy>,
    cache_2048: Cache<'buddy>,
    cache_4096: Cache<'buddy>,
    buddy: &'buddy Mutex<BuddyAllocator>,
}

/// Internal enum to pick the allocator responsible for a size.
enum SizeClass {
    Cache8,
    Cache32,
    Cache64,
    Cache128,
    Cache256,
    Cache512,
    Cache1024,
    Cache2048,
    Cache4096,
    Buddy,
}

impl SizeClass {
    fn for_size(size: usize) -> SizeClass {
        use SizeClass::*;

        match size {
            0..=8 => Cache8,
            9..=32 => Cache32,
            33..=64 => Cache64,
            65..=128 => Cache128,
            129..=256 => Cache256,
            257..=512 => Cache512,
            513..=1024 => Cache1024,
            1025..=2048 => Cache2048,
            2049..=4096 => Cache4096,
            _ => Buddy,
        }
    }
}

impl<'buddy> Heap<'buddy> {
    /// Mount a heap on top of `buddy`, which must already be initialized.
    pub fn new(buddy: &'buddy Mutex<BuddyAllocator>) -> Self {
        let backing = SharedBuddy::new(buddy);
        let mut heap = Self {
            cache_8: SlabCache::new(backing),
            cache_32: SlabCache::new(backing),
            cache_64: SlabCache::new(backing),
            cache_128: SlabCache::new(backing),
            cache_256: SlabCache::new(backing),
            cache_512: SlabCache::new(backing),
            cache_1024: SlabCache::new(backing),
            cache_2048: SlabCache::new(backing),
            cache_4096: SlabCache::new(backing),
            buddy,
        };

        heap.cache_8.initialize(8, "heap");
        heap.cache_32.initialize(32, "heap");
        heap.cache_64.initialize(64, "heap");
        heap.cache_128.initialize(128, "heap");
        heap.cache_256.initialize(256, "heap");
        heap.cache_512.initialize(512, "heap");
        heap.cache_1024.initialize(1024, "heap");
        heap.cache_2048.initialize(2048, "heap");
        heap.cache_4096.initialize(4096, "heap");
        heap
    }

    /// Allocate `size` bytes from the matching size class.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        match SizeClass::for_size(size) {
            SizeClass::Cache8 => self.cache_8.allocate(),
            SizeClass::Cache32 => self.cache_32.allocate(),
            SizeClass::Cache64 => self.cache_64.allocate(),
            SizeClass::Cache128 => self.cache_128.allocate(),
            SizeClass::Cache256 => self.cache_256.allocate(),
            SizeClass::Cache512 => self.cache_512.allocate(),
            SizeClass::Cache1024 => self.cache_1024.allocate(),
            SizeClass::Cache2048 => self.cache_2048.allocate(),
            SizeClass::Cache4096 => self.cache_4096.allocate(),
            SizeClass::Buddy => self
                .buddy
                .lock()
                .alloc(size, FillMode::Zero)
                .map(|allocation| allocation.ptr),
        }
    }

    /// Free a block that was allocated with the given `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this heap with the same `size` and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        match SizeClass::for_size(size) {
            SizeClass::Cache8 => self.cache_8.deallocate(ptr),
            SizeClass::Cache32 => self.cache_32.deallocate(ptr),
            SizeClass::Cache64 => self.cache_64.deallocate(ptr),
            SizeClass::Cache128 => self.cache_128.deallocate(ptr),
            SizeClass::Cache256 => self.cache_256.deallocate(ptr),
            SizeClass::Cache512 => self.cache_512.deallocate(ptr),
            SizeClass::Cache1024 => self.cache_1024.deallocate(ptr),
            SizeClass::Cache2048 => self.cache_2048.deallocate(ptr),
            SizeClass::Cache4096 => self.cache_4096.deallocate(ptr),
            SizeClass::Buddy => {
                let order = buddy::size_to_order(size);
                self.buddy.lock().free(ptr.as_ptr(), order);
            }
        }
    }

    /// Access one of the slab caches by its object size.
    pub fn cache(&self, object_size: usize) -> Option<&Cache<'buddy>> {
        match object_size {
            8 => Some(&self.cache_8),
            32 => Some(&self.cache_32),
            64 => Some(&self.cache_64),
            128 => Some(&self.cache_128),
            256 => Some(&self.cache_256),
            512 => Some(&self.cache_512),
            1024 => Some(&self.cache_1024),
            2048 => Some(&self.cache_2048),
            4096 => Some(&self.cache_4096),
            _ => None,
        }
    }
}

//! The buddy allocator tier.
//!
//! One [`BuddyAllocator`] owns a single contiguous region and serves
//! power-of-two blocks out of it. Oversized blocks are split on the way
//! down and free buddies are merged back together on the way up, so after
//! every allocation has been returned the region collapses back into one
//! top-level block.
//!
//! Orders use the internal convention of the freelist bank: a block of
//! order `k` spans `2^(k + 3)` bytes, and slot `k - MIN_ORDER` of the bank
//! holds the free blocks of that order.

use crate::freelist::FreelistBank;
use crate::init_once::InitOnce;
use crate::slab::BackingAllocator;
use crate::{AllocStats, Error, Result, PAGE_SIZE, SANITY_CHECKS};
use core::{cmp, ptr, ptr::NonNull};
use log::{debug, trace, warn};
use spin::Mutex;

/// The smallest order this allocator will serve; one page.
pub const MIN_ORDER: usize = 9;

/// The hard ceiling for the maximum order of any instance; 1 GiB.
pub const LARGEST_ALLOWED_ORDER: usize = 30;

/// How a block's content is prepared before it is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Zero the whole block.
    Zero,
    /// Leave the block untouched.
    None,
}

/// A successfully allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The start of the block.
    pub ptr: NonNull<u8>,
    /// The order the block was served at; pass this to
    /// [`free`](BuddyAllocator::free).
    pub order: usize,
    /// The number of pages the block spans.
    pub npages: usize,
}

/// The region configuration, frozen by the first `init`.
#[derive(Debug, Clone, Copy)]
struct Region {
    base: NonNull<u8>,
    max_order: usize,
}

/// The byte size of a block at `order`.
pub(crate) fn block_bytes(order: usize) -> usize {
    1 << (order + 3)
}

/// The order that fits an allocation of `size` bytes.
pub(crate) fn size_to_order(size: usize) -> usize {
    cmp::max(MIN_ORDER, ceil_log2(size >> 3))
}

fn ceil_log2(value: usize) -> usize {
    if value <= 1 {
        0
    } else {
        (usize::BITS - (value - 1).leading_zeros()) as usize
    }
}

/// The address of the buddy of `block` at `order`.
///
/// Buddies sit next to each other, so the pair only ever differs in the
/// single offset bit that `block_bytes(order)` selects.
fn buddy_of(base: *mut u8, block: *mut u8, order: usize) -> *mut u8 {
    let offset = block as usize - base as usize;
    (base as usize + (offset ^ block_bytes(order))) as *mut u8
}

pub struct BuddyAllocator {
    region: InitOnce<Region>,
    freelist: FreelistBank,
    stats: AllocStats,
}

// SAFETY: the raw region pointers are exclusively owned by this instance.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Create an uninitialized allocator; call [`init`](Self::init) before
    /// anything else.
    pub const fn new() -> Self {
        Self {
            region: InitOnce::new(),
            freelist: FreelistBank::new(),
            stats: AllocStats::with_name("buddy"),
        }
    }

    /// Hand the region starting at `base` over to this allocator.
    ///
    /// The maximum order becomes `target_order - 3`, which makes the region
    /// span `2^target_order` bytes. Only the first call has any effect;
    /// re-initialization is ignored.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `2^target_order` bytes,
    /// aligned to at least [`PAGE_SIZE`], and exclusively owned by this
    /// allocator from here on.
    pub unsafe fn init(&mut self, base: NonNull<u8>, target_order: usize) {
        if SANITY_CHECKS {
            assert!(
                target_order <= LARGEST_ALLOWED_ORDER,
                "target order exceeds the largest allowed order"
            );
            assert!(
                target_order >= MIN_ORDER + 3,
                "target order is below the minimum order"
            );
            assert_eq!(
                base.as_ptr() as usize % PAGE_SIZE,
                0,
                "region base must be page aligned"
            );
        }

        let max_order = target_order - 3;
        if !self.region.set(Region { base, max_order }) {
            warn!("buddy allocator is already initialized, ignoring re-init");
            return;
        }

        debug!("min-order: {}, max-order: {}", MIN_ORDER, max_order);

        self.freelist.clear();
        self.freelist.add(base.as_ptr(), max_order - MIN_ORDER);
        self.stats.total = block_bytes(max_order);
    }

    /// Allocate a block that can hold `size` bytes.
    ///
    /// The block may be bigger than requested; the returned
    /// [`Allocation`] carries the order it must later be freed at.
    pub fn alloc(&mut self, size: usize, fill: FillMode) -> Result<Allocation> {
        let region = *self.region.get().ok_or(Error::Uninitialized)?;
        let order = size_to_order(size);

        if SANITY_CHECKS && order > region.max_order {
            trace!(
                "requested order {} ({} bytes) is too large, max-order is {}",
                order,
                size,
                region.max_order
            );
            return Err(Error::OrderTooLarge);
        }

        // take the first free block at the requested order or above
        let mut found = None;
        for ord in order..=region.max_order {
            if let Some(block) = self.freelist.remove(ord - MIN_ORDER) {
                found = Some((block, ord));
                break;
            }
        }
        let (block, mut ord) = found.ok_or(Error::NoMemoryAvailable)?;

        // split the block down, parking the upper buddy at every order in
        // between
        while ord > order {
            ord -= 1;
            let buddy = buddy_of(region.base.as_ptr(), block.as_ptr(), ord);
            // SAFETY: the buddy is the upper half of a block we own.
            unsafe { self.freelist.add(buddy, ord - MIN_ORDER) };
        }

        let bytes = block_bytes(order);
        if let FillMode::Zero = fill {
            // SAFETY: the block spans `bytes` bytes of the region we own.
            unsafe { ptr::write_bytes(block.as_ptr(), 0, bytes) };
        }

        self.stats.requested += size;
        self.stats.allocated += bytes;
        trace!(
            "allocated {:p} at order {} (max: {} | min: {}) with a size of {}",
            block,
            order,
            region.max_order,
            MIN_ORDER,
            size
        );

        Ok(Allocation {
            ptr: block,
            order,
            npages: bytes / PAGE_SIZE,
        })
    }

    /// Return `block` to the allocator.
    ///
    /// A null `block` is a no-op. The order is trusted to be the one the
    /// block was allocated at; with sanity checks enabled an out-of-range
    /// order traps.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`alloc`](Self::alloc) on this
    /// instance at exactly `order` and must not be used afterwards.
    pub unsafe fn free(&mut self, block: *mut u8, order: usize) {
        if block.is_null() {
            return;
        }

        let Some(region) = self.region.get().copied() else {
            if SANITY_CHECKS {
                panic!("free() called before init()");
            }
            return;
        };

        if SANITY_CHECKS {
            assert!(
                (MIN_ORDER..=region.max_order).contains(&order),
                "invalid order passed to free()"
            );
        }

        trace!("freeing {:p} at order {}", block, order);
        self.stats.allocated = self.stats.allocated.saturating_sub(block_bytes(order));

        // there are no buddies at the top order
        if order == region.max_order {
            self.freelist.add(block, region.max_order - MIN_ORDER);
            return;
        }

        self.coalesce(region, block, order);
    }

    /// Merge `block` with its buddy into one block at `order + 1`, as long
    /// as the buddy is free, then try again one order up.
    ///
    /// The lower of the two addresses names the merged block. The chain
    /// stops at the first busy buddy or at the top order, where the block
    /// is parked on the freelist.
    unsafe fn coalesce(&mut self, region: Region, block: *mut u8, order: usize) {
        if order == region.max_order {
            self.freelist.add(block, order - MIN_ORDER);
            return;
        }

        let buddy = buddy_of(region.base.as_ptr(), block, order);
        let idx = order - MIN_ORDER;

        if self.freelist.find(buddy, idx) {
            self.freelist.remove_block(buddy, idx);
            trace!(
                "merging {:p} and {:p} into order {}",
                block,
                buddy,
                order + 1
            );
            self.coalesce(region, cmp::min(block, buddy), order + 1);
        } else {
            self.freelist.add(block, idx);
        }
    }

    /// The number of free blocks currently parked at `order`.
    pub fn free_count(&self, order: usize) -> usize {
        if !(MIN_ORDER..=LARGEST_ALLOWED_ORDER).contains(&order) {
            return 0;
        }
        self.freelist.len(order - MIN_ORDER)
    }

    /// The maximum order of this instance, once initialized.
    pub fn max_order(&self) -> Option<usize> {
        self.region.get().map(|region| region.max_order)
    }

    /// A snapshot of the allocator statistics.
    pub fn stats(&self) -> AllocStats {
        self.stats.clone()
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingAllocator for BuddyAllocator {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.alloc(size, FillMode::Zero)
            .map(|allocation| allocation.ptr)
    }
}

/// Handle to a buddy allocator that is shared between many users.
///
/// This is the production [`BackingAllocator`]: every slab cache of a heap
/// holds a copy and draws its backing blocks from the same locked buddy.
#[derive(Clone, Copy)]
pub struct SharedBuddy<'buddy> {
    buddy: &'buddy Mutex<BuddyAllocator>,
}

impl<'buddy> SharedBuddy<'buddy> {
    pub const fn new(buddy: &'buddy Mutex<BuddyAllocator>) -> Self {
        Self { buddy }
    }
}

impl BackingAllocator for SharedBuddy<'_> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.buddy
            .lock()
            .alloc(size, FillMode::Zero)
            .map(|allocation| allocation.ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freelist::ORDER_SLOTS;
    use std::alloc::{alloc, dealloc, Layout};
    use std::vec::Vec;

    /// A page aligned heap region released on drop.
    struct TestHeap {
        base: NonNull<u8>,
        layout: Layout,
    }

    impl TestHeap {
        fn new(target_order: usize) -> Self {
            let layout = Layout::from_size_align(1 << target_order, PAGE_SIZE).unwrap();
            let base = NonNull::new(unsafe { alloc(layout) }).unwrap();
            Self { base, layout }
        }
    }

    impl Drop for TestHeap {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    /// 1 MiB heap: max order 17, top slot holds one block after init.
    const TEST_TARGET_ORDER: usize = 20;
    const TEST_MAX_ORDER: usize = TEST_TARGET_ORDER - 3;

    fn init_buddy(heap: &TestHeap) -> BuddyAllocator {
        let mut buddy = BuddyAllocator::new();
        unsafe { buddy.init(heap.base, TEST_TARGET_ORDER) };
        buddy
    }

    /// Drain every freelist and return the parked blocks as
    /// `(offset, bytes)` pairs.
    fn drain_free_blocks(buddy: &mut BuddyAllocator, base: NonNull<u8>) -> Vec<(usize, usize)> {
        let mut blocks = Vec::new();
        for idx in 0..ORDER_SLOTS {
            while let Some(block) = buddy.freelist.remove(idx) {
                let offset = block.as_ptr() as usize - base.as_ptr() as usize;
                blocks.push((offset, block_bytes(idx + MIN_ORDER)));
            }
        }
        blocks
    }

    #[test]
    fn order_computation() {
        assert_eq!(size_to_order(0), MIN_ORDER);
        assert_eq!(size_to_order(1), MIN_ORDER);
        assert_eq!(size_to_order(PAGE_SIZE), 9);
        // the truncating `>> 3` swallows the extra byte
        assert_eq!(size_to_order(PAGE_SIZE + 1), 9);
        assert_eq!(size_to_order(2 * PAGE_SIZE), 10);
        assert_eq!(size_to_order(16 * 1024), 11);
        assert_eq!(block_bytes(9), PAGE_SIZE);
        assert_eq!(block_bytes(TEST_MAX_ORDER), 1 << TEST_TARGET_ORDER);
    }

    #[test]
    fn buddy_addresses_pair_up() {
        let base = 0x1000_0000 as *mut u8;
        let block = 0x1000_1000 as *mut u8;

        assert_eq!(buddy_of(base, base, 9) as usize, base as usize + PAGE_SIZE);
        assert_eq!(buddy_of(base, block, 9), base);
        // the pair at order 10 spans two pages
        assert_eq!(
            buddy_of(base, base, 10) as usize,
            base as usize + 2 * PAGE_SIZE
        );
    }

    #[test]
    fn init_parks_one_top_level_block() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let buddy = init_buddy(&heap);

        for order in MIN_ORDER..TEST_MAX_ORDER {
            assert_eq!(buddy.free_count(order), 0);
        }
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
        assert_eq!(buddy.stats().total, 1 << TEST_TARGET_ORDER);
    }

    #[test]
    fn re_init_is_ignored() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let other = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        unsafe { buddy.init(other.base, TEST_TARGET_ORDER) };

        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
        let block = buddy.alloc(PAGE_SIZE, FillMode::None).unwrap();
        let offset = block.ptr.as_ptr() as usize - heap.base.as_ptr() as usize;
        assert!(offset < 1 << TEST_TARGET_ORDER);
    }

    #[test]
    fn alloc_before_init_fails() {
        let mut buddy = BuddyAllocator::new();
        assert_eq!(
            buddy.alloc(PAGE_SIZE, FillMode::None),
            Err(Error::Uninitialized)
        );
    }

    #[test]
    fn split_chain_covers_every_order() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let allocation = buddy.alloc(PAGE_SIZE, FillMode::Zero).unwrap();
        assert_eq!(allocation.order, MIN_ORDER);
        assert_eq!(allocation.npages, 1);
        assert_eq!(allocation.ptr, heap.base);

        // the top block was split all the way down, parking one buddy at
        // every order in between
        for order in MIN_ORDER..TEST_MAX_ORDER {
            assert_eq!(buddy.free_count(order), 1, "order {order}");
        }
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 0);

        let stats = buddy.stats();
        assert_eq!(stats.requested, PAGE_SIZE);
        assert_eq!(stats.allocated, PAGE_SIZE);
    }

    #[test]
    fn zero_fill_clears_the_block() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        unsafe { heap.base.as_ptr().write_bytes(0x5A, PAGE_SIZE) };
        let allocation = buddy.alloc(PAGE_SIZE, FillMode::Zero).unwrap();

        let bytes =
            unsafe { core::slice::from_raw_parts(allocation.ptr.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn free_coalesces_back_to_the_top() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let allocation = buddy.alloc(PAGE_SIZE, FillMode::None).unwrap();
        unsafe { buddy.free(allocation.ptr.as_ptr(), allocation.order) };

        for order in MIN_ORDER..TEST_MAX_ORDER {
            assert_eq!(buddy.free_count(order), 0, "order {order}");
        }
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
        assert_eq!(buddy.stats().allocated, 0);
    }

    #[test]
    fn round_trip_restores_the_freelist_state() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        // fragment the region a little first
        let keep = buddy.alloc(8 * PAGE_SIZE, FillMode::None).unwrap();

        let before: Vec<_> = (MIN_ORDER..=TEST_MAX_ORDER)
            .map(|order| buddy.free_count(order))
            .collect();

        let allocation = buddy.alloc(2 * PAGE_SIZE, FillMode::None).unwrap();
        unsafe { buddy.free(allocation.ptr.as_ptr(), allocation.order) };

        let after: Vec<_> = (MIN_ORDER..=TEST_MAX_ORDER)
            .map(|order| buddy.free_count(order))
            .collect();
        assert_eq!(before, after);

        unsafe { buddy.free(keep.ptr.as_ptr(), keep.order) };
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let result = buddy.alloc(2 << TEST_TARGET_ORDER, FillMode::None);
        if SANITY_CHECKS {
            assert_eq!(result, Err(Error::OrderTooLarge));
        } else {
            assert_eq!(result, Err(Error::NoMemoryAvailable));
        }
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let top = buddy
            .alloc(1 << TEST_TARGET_ORDER, FillMode::None)
            .unwrap();
        assert_eq!(top.order, TEST_MAX_ORDER);
        assert_eq!(
            buddy.alloc(PAGE_SIZE, FillMode::None),
            Err(Error::NoMemoryAvailable)
        );

        unsafe { buddy.free(top.ptr.as_ptr(), top.order) };
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
    }

    #[test]
    fn freeing_null_is_a_noop() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        unsafe { buddy.free(ptr::null_mut(), MIN_ORDER) };
        assert_eq!(buddy.free_count(TEST_MAX_ORDER), 1);
    }

    #[test]
    #[should_panic(expected = "invalid order passed to free()")]
    #[cfg(feature = "sanity-checks")]
    fn freeing_at_an_invalid_order_traps() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        unsafe { buddy.free(heap.base.as_ptr(), MIN_ORDER - 1) };
    }

    #[test]
    fn live_and_free_blocks_partition_the_region() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let mut live = Vec::new();
        for size in [PAGE_SIZE, 2 * PAGE_SIZE, PAGE_SIZE, 16 * PAGE_SIZE, PAGE_SIZE] {
            live.push(buddy.alloc(size, FillMode::None).unwrap());
        }
        // free a couple of them again to force some coalescing
        for allocation in [live.remove(2), live.remove(0)] {
            unsafe { buddy.free(allocation.ptr.as_ptr(), allocation.order) };
        }

        let mut blocks: Vec<(usize, usize)> = live
            .iter()
            .map(|allocation| {
                let offset =
                    allocation.ptr.as_ptr() as usize - heap.base.as_ptr() as usize;
                (offset, block_bytes(allocation.order))
            })
            .collect();
        blocks.extend(drain_free_blocks(&mut buddy, heap.base));
        blocks.sort_unstable();

        // no overlaps, no gaps: the blocks tile the whole region
        let mut cursor = 0;
        for (offset, bytes) in blocks {
            assert_eq!(offset, cursor, "hole or overlap at offset {offset}");
            assert_eq!(offset % bytes, 0, "block at {offset} is misaligned");
            cursor = offset + bytes;
        }
        assert_eq!(cursor, 1 << TEST_TARGET_ORDER);
    }

    #[test]
    fn no_two_free_buddies_stay_unmerged() {
        let heap = TestHeap::new(TEST_TARGET_ORDER);
        let mut buddy = init_buddy(&heap);

        let mut live = Vec::new();
        for _ in 0..32 {
            live.push(buddy.alloc(PAGE_SIZE, FillMode::None).unwrap());
        }
        // free every second block, then the rest in reverse
        for allocation in live.iter().skip(1).step_by(2) {
            unsafe { buddy.free(allocation.ptr.as_ptr(), allocation.order) };
        }
        for allocation in live.iter().step_by(2).rev() {
            unsafe { buddy.free(allocation.ptr.as_ptr(), allocation.order) };
        }

        let base = heap.base;
        for idx in 0..ORDER_SLOTS {
            let order = idx + MIN_ORDER;
            let blocks: Vec<_> = core::iter::from_fn(|| buddy.freelist.remove(idx)).collect();
            for block in &blocks {
                let other = buddy_of(base.as_ptr(), block.as_ptr(), order);
                assert!(
                    !blocks.iter().any(|candidate| candidate.as_ptr() == other),
                    "buddies left unmerged at order {order}"
                );
            }
        }
    }
}

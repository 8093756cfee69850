//! Slab caches for fixed-size objects.
//!
//! A [`SlabCache`] serves objects of one fixed size. It draws backing
//! blocks from a [`BackingAllocator`] (in production the buddy tier),
//! carves each block's first page into `PAGE_SIZE / object_size` objects
//! threaded through their own first words, and keeps per-slab bookkeeping
//! in the block's second page. Masking an object address to its page
//! therefore leads straight back to its slab, so deallocation never has to
//! search.
//!
//! Only slabs with at least one free object are queued; a slab that runs
//! full drops off the queue and re-enters it at the head once one of its
//! objects comes back. Backing blocks are never handed back to the backing
//! allocator.

use crate::init_once::InitOnce;
use crate::lock::{Lock, NoopLock};
use crate::queue::{Queue, QueueHook, Queueable};
use crate::{Error, Result, PAGE_SIZE, SANITY_CHECKS};
use core::{mem, ptr::NonNull};
use log::{debug, trace, warn};

/// Sources of raw backing memory for slab caches.
pub trait BackingAllocator {
    /// Allocate a block of at least `size` bytes, aligned to at least
    /// [`PAGE_SIZE`].
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>>;
}

/// Marks a slab header as such; `HEARTH!!`.
const SLAB_MAGIC: usize = 0x4845_4152_5448_2121;

/// A free object, linked through its first word.
struct FreeObject {
    next: Option<NonNull<FreeObject>>,
}

/// Per-slab bookkeeping, stored in the second page of the backing block.
#[repr(C)]
struct Slab {
    hook: QueueHook<Slab>,
    /// The page holding this slab's objects.
    page: NonNull<u8>,
    free_head: Option<NonNull<FreeObject>>,
    free_count: usize,
    magic: usize,
}

impl Queueable for Slab {
    fn hook(&mut self) -> &mut QueueHook<Self> {
        &mut self.hook
    }
}

/// The cache configuration, frozen by the first `initialize`.
#[derive(Debug, Clone, Copy)]
struct CacheConfig {
    object_size: usize,
    label: &'static str,
}

/// A pool of equally sized objects carved out of backing pages.
pub struct SlabCache<B, L = NoopLock> {
    config: InitOnce<CacheConfig>,
    /// Slabs that still have free objects; empty slabs count as partial.
    partial: Queue<Slab>,
    slab_count: usize,
    free_objects: usize,
    allocated_objects: usize,
    backing: B,
    lock: L,
}

// SAFETY: the queued slab pointers are exclusively owned by this cache.
unsafe impl<B: Send, L: Send> Send for SlabCache<B, L> {}

impl<B: BackingAllocator> SlabCache<B> {
    /// Create a cache without mutual exclusion; call
    /// [`initialize`](Self::initialize) before anything else.
    pub const fn new(backing: B) -> Self {
        Self::with_lock(backing, NoopLock)
    }
}

impl<B: BackingAllocator, L: Lock> SlabCache<B, L> {
    /// Create a cache guarding every operation with `lock`.
    pub const fn with_lock(backing: B, lock: L) -> Self {
        Self {
            config: InitOnce::new(),
            partial: Queue::new(),
            slab_count: 0,
            free_objects: 0,
            allocated_objects: 0,
            backing,
            lock,
        }
    }

    /// Record the object size and label of this cache.
    ///
    /// No slab is allocated until the first [`allocate`](Self::allocate).
    /// Only the first call has any effect. `object_size` must be a
    /// word-sized multiple that evenly divides [`PAGE_SIZE`].
    pub fn initialize(&mut self, object_size: usize, label: &'static str) {
        if SANITY_CHECKS {
            assert!(
                object_size >= mem::size_of::<usize>(),
                "object size must be able to hold a freelist link"
            );
            assert!(
                object_size <= PAGE_SIZE && PAGE_SIZE % object_size == 0,
                "object size must evenly divide a page"
            );
        }

        if !self.config.set(CacheConfig { object_size, label }) {
            warn!("slab cache is already initialized, ignoring");
            return;
        }

        debug!("initialized slab cache `{label}` for {object_size} byte objects");
    }

    /// Hand out one object.
    ///
    /// Fails only if the cache was never initialized or the backing
    /// allocator cannot supply a fresh slab.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        let _guard = self.lock.guard();
        let config = *self.config.get().ok_or(Error::Uninitialized)?;

        if self.partial.is_empty() {
            let count = Self::grow(&mut self.backing, &mut self.partial, config)?;
            self.slab_count += 1;
            self.free_objects += count;
        }

        let mut slab_ptr = self
            .partial
            .front()
            .expect("a freshly grown cache must have a partial slab");

        let (object, now_full) = {
            // SAFETY: queued slab headers stay valid for the cache lifetime.
            let slab = unsafe { slab_ptr.as_mut() };
            let mut object = slab
                .free_head
                .expect("a queued slab must have a free object");

            // SAFETY: the link word is owned by the freelist until the
            // object is handed out.
            slab.free_head = unsafe { object.as_mut().next };
            slab.free_count -= 1;
            (object, slab.free_head.is_none())
        };

        if now_full {
            // full slabs leave the queue; deallocate re-queues them
            self.partial.dequeue();
        }

        self.free_objects -= 1;
        self.allocated_objects += 1;
        Ok(object.cast())
    }

    /// Return `object` to its slab.
    ///
    /// # Safety
    ///
    /// `object` must have been returned by [`allocate`](Self::allocate) on
    /// this cache and must not have been freed since.
    pub unsafe fn deallocate(&mut self, object: NonNull<u8>) {
        let _guard = self.lock.guard();

        // the object page is page aligned; the slab header lives one page
        // above it
        let page = (object.as_ptr() as usize & !(PAGE_SIZE - 1)) as *mut u8;
        let header = page.add(PAGE_SIZE) as *mut Slab;
        let slab = &mut *header;

        if SANITY_CHECKS {
            assert_eq!(
                slab.magic, SLAB_MAGIC,
                "pointer does not belong to a slab cache"
            );
            assert_eq!(
                slab.page.as_ptr(),
                page,
                "slab header does not match the object page"
            );
        }

        let was_full = slab.free_head.is_none();
        let mut free = object.cast::<FreeObject>();
        free.as_mut().next = slab.free_head;
        slab.free_head = Some(free);
        slab.free_count += 1;

        self.free_objects += 1;
        self.allocated_objects -= 1;

        if was_full {
            // prefer the slab that just got an object back for the next
            // allocation
            self.partial
                .enqueue_head(NonNull::new_unchecked(header));
        }
    }

    /// Obtain a fresh backing block and queue it as a new slab.
    ///
    /// Returns the number of objects the new slab provides.
    fn grow(backing: &mut B, partial: &mut Queue<Slab>, config: CacheConfig) -> Result<usize> {
        let block = backing.allocate(2 * PAGE_SIZE)?;
        let count = PAGE_SIZE / config.object_size;

        // SAFETY
        // The backing allocator handed us an exclusive, page aligned block
        // of at least two pages: objects in the first, the header in the
        // second.
        unsafe {
            let page = block.as_ptr();
            for idx in 0..count {
                let object = page.add(idx * config.object_size) as *mut FreeObject;
                let next = if idx + 1 < count {
                    Some(NonNull::new_unchecked(
                        page.add((idx + 1) * config.object_size) as *mut FreeObject,
                    ))
                } else {
                    None
                };
                (*object).next = next;
            }

            let header = page.add(PAGE_SIZE) as *mut Slab;
            header.write(Slab {
                hook: QueueHook::new(),
                page: block,
                free_head: Some(NonNull::new_unchecked(page as *mut FreeObject)),
                free_count: count,
                magic: SLAB_MAGIC,
            });
            partial.enqueue(NonNull::new_unchecked(header));
        }

        trace!(
            "cache `{}`: grew a new slab with {} objects",
            config.label,
            count
        );
        Ok(count)
    }

    /// The configured object size, once initialized.
    pub fn object_size(&self) -> Option<usize> {
        self.config.get().map(|config| config.object_size)
    }

    /// The configured label, once initialized.
    pub fn label(&self) -> Option<&'static str> {
        self.config.get().map(|config| config.label)
    }

    /// The number of slabs this cache has grown so far.
    pub fn slab_count(&self) -> usize {
        self.slab_count
    }

    /// The number of objects currently sitting on slab freelists.
    pub fn free_objects(&self) -> usize {
        self.free_objects
    }

    /// The number of objects currently handed out.
    pub fn allocated_objects(&self) -> usize {
        self.allocated_objects
    }
}

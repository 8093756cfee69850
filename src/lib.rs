//! Two-tier in-process memory allocator.
//!
//! A [`BuddyAllocator`] manages one contiguous region by splitting and
//! coalescing power-of-two blocks, and [`SlabCache`]s consume blocks from it
//! to serve small fixed-size objects from embedded freelists. The slab tier
//! talks to the buddy tier only through the [`BackingAllocator`] trait, so
//! either tier can also be used on its own.
//!
//! The crate is `no_std` and performs no allocations of its own; the caller
//! hands the buddy allocator a region at [`BuddyAllocator::init`] and full
//! ownership of that region passes to the allocator.

#![no_std]
#![deny(rust_2018_idioms)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("hearth can only run on 64 bit systems");

#[cfg(test)]
extern crate std;

pub mod buddy;
pub mod freelist;
pub mod heap;
pub mod init_once;
pub mod lock;
pub mod queue;
pub mod slab;
pub mod unit;

pub use buddy::{Allocation, BuddyAllocator, FillMode, SharedBuddy};
pub use heap::Heap;
pub use init_once::InitOnce;
pub use lock::{Lock, NoopLock};
pub use slab::{BackingAllocator, SlabCache};

use core::fmt;
use displaydoc_lite::displaydoc;

/// The size of a single page in memory.
///
/// This is also the smallest block size the buddy allocator will serve.
pub const PAGE_SIZE: usize = 4 * unit::KIB;

/// Result for every memory allocation operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub(crate) const SANITY_CHECKS: bool = cfg!(feature = "sanity-checks");

displaydoc! {
    /// Any error that can happen while allocating or deallocating memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// the allocator was used before it was initialized
        Uninitialized,
        /// tried to allocate an order that exceeded the maximum order
        OrderTooLarge,
        /// tried to allocate, but there was no free memory left
        NoMemoryAvailable,
    }
}

/// Statistics for a memory allocator.
#[derive(Debug, Clone)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes that were requested by the users of the allocator.
    pub requested: usize,
    /// The number of bytes that are currently handed out.
    pub allocated: usize,
    /// The total number of bytes this allocator has available for allocation.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            requested: 0,
            allocated: 0,
            total: 0,
        }
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nRequested bytes: {}", unit::bytes(self.requested))?;
        writeln!(f, "Allocated bytes: {}", unit::bytes(self.allocated))?;
        writeln!(f, "Total bytes:     {}", unit::bytes(self.total))?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}

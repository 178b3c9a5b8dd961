#![cfg_attr(not(test), no_std)]

//! A buddy block allocator with a slab object allocator on top.
//!
//! [`Kmem::init`] takes a caller-supplied region of `BLOCK_SIZE`-byte
//! blocks. The first block holds the allocator context; the rest are managed
//! by a [`BuddyAllocator`] in power-of-two runs. On top of it:
//!
//! - object caches ([`Kmem::create_cache`]) carve slabs out of buddy runs and
//!   hand out fixed-size objects, with optional constructor and destructor
//!   hooks;
//! - the cache of caches is the cache whose objects are the descriptors of
//!   every other cache, so the slab layer needs no other memory;
//! - thirteen power-of-two small buffer caches, from 32 bytes to 128 KiB,
//!   back [`Kmem::alloc_buffer`] and the [`GlobalAlloc`](core::alloc::GlobalAlloc)
//!   impl.
//!
//! Everything is guarded by spin locks, so a `Kmem` can be shared freely
//! between threads.

pub mod allocators;
pub mod buddy;
pub mod config;
pub mod error;
pub mod region;
pub mod slab;
mod slablist;

pub use allocators::{
    Cache, Kmem, MAX_BUFFER_SHIFT, MIN_ALIGN, MIN_BLOCKS, MIN_BUFFER_SHIFT, SIZE_CLASSES,
};
pub use buddy::{BuddyAllocator, Report, Run, Stats, Validity, ORDER_COUNT};
pub use config::{Config, DestroyPolicy};
pub use error::{Error, ErrorCode, Result};
#[cfg(feature = "use_libc")]
pub use region::MmapRegion;
pub use slab::{CacheInfo, CacheName, Geometry, ObjectHook, SlabCache};

/// Size of a block, the unit of buddy allocation.
pub const BLOCK_SIZE: usize = 4096;

/// Size of an L1 cache line, the unit of cache colouring.
pub const CACHE_LINE_SIZE: usize = 64;

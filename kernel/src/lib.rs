//! `kmem`: a buddy block allocator and a slab object allocator that live
//! entirely inside one caller-supplied memory region.
//!
//! ```text
//! Kmem
//!  +-- kmalloc / kfree        size-class buckets, 32 B .. 128 KiB
//!  +-- kmem_cache_*           named caches with ctor / dtor hooks
//!        |
//!        +-- slabs            EMPTY / HAS_SPACE / FULL lists
//!              |
//!              +-- BuddyAllocator   power-of-two blocks of BLOCK_SIZE
//! ```
#![no_std]
#![allow(clippy::needless_return)]

#[cfg(test)]
extern crate std;

pub mod libs;
pub mod mm;

pub use kmem_error::{ErrorFlags, KmemError, KmemResult};

pub use crate::mm::allocator::block::{BlockCount, BlockUsage};
pub use crate::mm::allocator::buddy::{BuddyAllocator, BuddyConfig};
pub use crate::mm::allocator::kmem_cache::CacheInfo;
pub use crate::mm::allocator::slab::{ObjectHook, SlabUsage};
pub use crate::mm::kmem::{CacheHandle, Kmem};
pub use crate::mm::BLOCK_SIZE;

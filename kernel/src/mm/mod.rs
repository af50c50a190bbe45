//! Block and object allocation over a caller-supplied memory region.

pub mod allocator;
pub mod kmem;

/// Shift of the buddy allocator's unit block.
pub const BLOCK_SHIFT: usize = 12;
/// Size of the buddy allocator's unit block (order 0), in bytes.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;

/// Smallest `kmalloc` size class is `1 << KMALLOC_MIN_SHIFT` bytes.
pub const KMALLOC_MIN_SHIFT: usize = 5;
/// Largest `kmalloc` size class is `1 << KMALLOC_MAX_SHIFT` bytes.
pub const KMALLOC_MAX_SHIFT: usize = 17;
pub const KMALLOC_BUCKETS: usize = KMALLOC_MAX_SHIFT - KMALLOC_MIN_SHIFT + 1;

/// Room for a cache name including the terminating zero.
pub const CACHE_NAME_LEN: usize = 32;
/// Granularity of the slab colour offset.
pub const CACHE_LINE_SIZE: usize = 64;
/// Alignment of a slab's object area.
pub const OBJECT_ALIGN: usize = core::mem::size_of::<usize>();

/// Orders below this carry no free bitmap by default.
pub const DEFAULT_BITMAP_MIN_ORDER: usize = 0;

//! Buddy block allocator over a caller-supplied region.
//!
//! The region is laid out as
//!
//! ```text
//! | ArenaHeader | OrderEntry * max_order | bitmaps | pad | usable blocks ... |
//! ```
//!
//! Block offsets are counted in unit blocks from the usable start. A block of
//! order `k` spans `1 << k` unit blocks and its offset is a multiple of
//! `1 << k`; its buddy sits at `offset ^ (1 << k)`.
use log::{debug, trace, warn};

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use bitmap::{traits::BitMapOps, SliceBitmap};
use kmem_error::{KmemError, KmemResult};

use crate::libs::align::{align_up, check_aligned};
use crate::libs::intrusive_list::{IntrusiveList, ListNode};
use crate::libs::log2::ceil_log2;
use crate::libs::spinlock::SpinLock;
use crate::mm::allocator::block::{BlockCount, BlockUsage};
use crate::mm::{BLOCK_SIZE, DEFAULT_BITMAP_MIN_ORDER};

/// Marks a region that currently holds a live arena.
const ARENA_MAGIC: usize = 0x6275_6464_7921_a5a5_u64 as usize;
/// Marks a block header written by the free lists.
const FREE_BLOCK_MAGIC: usize = 0x6672_6565_b10c_5a5a_u64 as usize;

/// Runtime knobs of the buddy allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyConfig {
    /// Orders below this keep no free bitmap; their buddies are looked up in
    /// the free list instead.
    pub bitmap_min_order: usize,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            bitmap_min_order: DEFAULT_BITMAP_MIN_ORDER,
        }
    }
}

/// Free-list node, written at the start of every free block.
#[repr(C)]
#[derive(Debug)]
struct FreeBlock {
    prev: Option<NonNull<FreeBlock>>,
    next: Option<NonNull<FreeBlock>>,
    order: usize,
    magic: usize,
}

impl ListNode for FreeBlock {
    fn next(&self) -> Option<NonNull<Self>> {
        self.next
    }
    fn prev(&self) -> Option<NonNull<Self>> {
        self.prev
    }
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.prev = prev;
    }
}

/// Per-order table entry.
#[repr(C)]
#[derive(Debug)]
struct OrderEntry {
    free_list: IntrusiveList<FreeBlock>,
    /// null when the order has no bitmap
    bitmap: *mut u8,
    bitmap_bits: usize,
}

#[repr(C)]
#[derive(Debug)]
struct ArenaHeader {
    magic: usize,
    start: *mut u8,
    total_size: usize,
    max_order: usize,
    bitmap_min_order: usize,
    usable_start: *mut u8,
    usable_blocks: usize,
    free_blocks: usize,
    table: *mut OrderEntry,
}

/// Where each metadata piece lands inside the region.
struct ArenaLayout {
    max_order: usize,
    bitmap_min_order: usize,
    table_offset: usize,
    bitmap_offset: usize,
    usable_offset: usize,
    usable_blocks: usize,
}

impl ArenaLayout {
    fn bitmap_bits(total_blocks: usize, order: usize) -> usize {
        return (total_blocks >> order) + usize::from(total_blocks & ((1 << order) - 1) != 0);
    }

    fn compute(space: usize, total_size: usize, config: BuddyConfig) -> KmemResult<Self> {
        let total_blocks = total_size / BLOCK_SIZE;
        if total_blocks == 0 {
            return Err(KmemError::NOT_ENOUGH_MEMORY_TO_INIT);
        }
        let max_order = ceil_log2(total_blocks) + 1;
        let bitmap_min_order = config.bitmap_min_order.min(max_order);

        let table_offset = align_up(size_of::<ArenaHeader>(), align_of::<OrderEntry>());
        let bitmap_offset = table_offset + max_order * size_of::<OrderEntry>();
        let bitmap_bytes: usize = (bitmap_min_order..max_order)
            .map(|order| SliceBitmap::<u8>::bytes_for(Self::bitmap_bits(total_blocks, order)))
            .sum();

        let end = space + total_size;
        let usable_start = align_up(space + bitmap_offset + bitmap_bytes, BLOCK_SIZE);
        if usable_start >= end || end - usable_start < BLOCK_SIZE {
            return Err(KmemError::NOT_ENOUGH_MEMORY_TO_INIT);
        }

        return Ok(Self {
            max_order,
            bitmap_min_order,
            table_offset,
            bitmap_offset,
            usable_offset: usable_start - space,
            usable_blocks: (end - usable_start) / BLOCK_SIZE,
        });
    }
}

struct Arena {
    header: NonNull<ArenaHeader>,
}

unsafe impl Send for Arena {}

impl Arena {
    fn header(&self) -> &ArenaHeader {
        return unsafe { self.header.as_ref() };
    }

    fn header_mut(&mut self) -> &mut ArenaHeader {
        return unsafe { self.header.as_mut() };
    }

    fn entry(&self, order: usize) -> &OrderEntry {
        assert!(order < self.header().max_order);
        return unsafe { &*self.header().table.add(order) };
    }

    fn entry_mut(&mut self, order: usize) -> &mut OrderEntry {
        assert!(order < self.header().max_order);
        return unsafe { &mut *self.header().table.add(order) };
    }

    fn bitmap(&self, order: usize) -> Option<SliceBitmap<'_, u8>> {
        let entry = self.entry(order);
        if entry.bitmap.is_null() {
            return None;
        }
        return Some(unsafe { SliceBitmap::from_raw_parts(entry.bitmap, entry.bitmap_bits) });
    }

    fn set_free_bit(&mut self, offset: usize, order: usize, value: bool) {
        if let Some(mut bmp) = self.bitmap(order) {
            bmp.set(offset >> order, value);
        }
    }

    fn block_ptr(&self, offset: usize) -> NonNull<u8> {
        let addr = unsafe { self.header().usable_start.add(offset * BLOCK_SIZE) };
        // usable_start is never null
        return unsafe { NonNull::new_unchecked(addr) };
    }

    /// Block offset of `ptr`, if it points at a unit block of the usable area.
    fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let start = self.header().usable_start as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < start || !check_aligned(addr - start, BLOCK_SIZE) {
            return None;
        }
        let offset = (addr - start) / BLOCK_SIZE;
        if offset >= self.header().usable_blocks {
            return None;
        }
        return Some(offset);
    }

    fn fits(&self, offset: usize, order: usize) -> bool {
        return offset + (1 << order) <= self.header().usable_blocks;
    }

    /// Write a free-block node at `offset` and link it into the order's list.
    unsafe fn push_free(&mut self, offset: usize, order: usize) {
        let node = self.block_ptr(offset).cast::<FreeBlock>();
        ptr::write(
            node.as_ptr(),
            FreeBlock {
                prev: None,
                next: None,
                order,
                magic: FREE_BLOCK_MAGIC,
            },
        );
        self.entry_mut(order).free_list.insert_ordered(node);
        self.set_free_bit(offset, order, true);
        self.header_mut().free_blocks += 1 << order;
    }

    /// Unlink the free block at `offset` from the order's list.
    unsafe fn take_free(&mut self, offset: usize, order: usize) {
        let mut node = self.block_ptr(offset).cast::<FreeBlock>();
        debug_assert_eq!(node.as_ref().magic, FREE_BLOCK_MAGIC);
        debug_assert_eq!(node.as_ref().order, order);
        self.entry_mut(order).free_list.remove(node);
        node.as_mut().magic = 0;
        self.set_free_bit(offset, order, false);
        self.header_mut().free_blocks -= 1 << order;
    }

    /// Whether the block at `offset` is free at exactly `order`.
    fn is_free(&self, offset: usize, order: usize) -> bool {
        if let Some(bmp) = self.bitmap(order) {
            return bmp.get(offset >> order).unwrap_or(false);
        }

        let node = self.block_ptr(offset).cast::<FreeBlock>();
        return unsafe { self.entry(order).free_list.contains(node) };
    }

    /// Whether the block at `offset` lies inside a free block of `order` or above.
    fn covered_by_free(&self, offset: usize, order: usize) -> bool {
        return (order..self.header().max_order).any(|o| {
            let base = offset & !((1 << o) - 1);
            self.fits(base, o) && self.is_free(base, o)
        });
    }

    /// Take a block of `order`, splitting a larger one if needed.
    unsafe fn alloc_order(&mut self, order: usize) -> KmemResult<usize> {
        let max_order = self.header().max_order;
        if order >= max_order {
            return Err(KmemError::NOT_ENOUGH_MEMORY);
        }

        let mut current = (order..max_order)
            .find(|&o| !self.entry(o).free_list.is_empty())
            .ok_or(KmemError::NOT_ENOUGH_MEMORY)?;

        let head = self
            .entry(current)
            .free_list
            .head()
            .ok_or(KmemError::NOT_ENOUGH_MEMORY)?;
        let offset = self
            .offset_of(head.cast())
            .expect("buddy: free list holds a block outside the arena");
        self.take_free(offset, current);

        while current > order {
            current -= 1;
            let upper = offset + (1 << current);
            trace!("buddy: split offset {offset} -> upper half {upper} at order {current}");
            self.push_free(upper, current);
        }

        return Ok(offset);
    }

    /// Return the block at `offset` and coalesce it with free buddies.
    unsafe fn free_order(&mut self, mut offset: usize, mut order: usize) {
        let max_order = self.header().max_order;
        while order + 1 < max_order {
            let buddy = offset ^ (1 << order);
            if !self.fits(buddy, order) || !self.is_free(buddy, order) {
                break;
            }
            self.take_free(buddy, order);
            trace!("buddy: merge offset {offset} with {buddy} at order {order}");
            offset = offset.min(buddy);
            order += 1;
        }
        self.push_free(offset, order);
    }
}

/// Buddy block allocator context.
///
/// The context is empty until [`BuddyAllocator::init`] binds it to a region;
/// every operation takes the internal lock for its whole duration.
pub struct BuddyAllocator {
    arena: SpinLock<Option<Arena>>,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        return Self {
            arena: SpinLock::new(None),
        };
    }

    /// Bind the allocator to `[space, space + total_size)` with the default config.
    ///
    /// # Safety
    ///
    /// See [`BuddyAllocator::init_with_config`].
    pub unsafe fn init(&self, space: *mut u8, total_size: usize) -> KmemResult<()> {
        return self.init_with_config(space, total_size, BuddyConfig::default());
    }

    /// Bind the allocator to a region.
    ///
    /// ## Parameters
    ///
    /// - `space` - start of the region
    /// - `total_size` - size of the region in bytes
    /// - `config` - runtime knobs
    ///
    /// ## Returns
    ///
    /// - `PARAM_ERROR` - `space` is null or misaligned, or `total_size` is zero
    /// - `SYSTEM_ALREADY_INITIALIZED` - this context, or the region, is live
    /// - `NOT_ENOUGH_MEMORY_TO_INIT` - metadata plus one block do not fit
    ///
    /// # Safety
    ///
    /// The region must be initialized memory, valid for reads and writes, and
    /// must stay untouched by anyone else until [`BuddyAllocator::destroy`].
    pub unsafe fn init_with_config(
        &self,
        space: *mut u8,
        total_size: usize,
        config: BuddyConfig,
    ) -> KmemResult<()> {
        if space.is_null() || total_size == 0 {
            return Err(KmemError::PARAM_ERROR);
        }
        if !check_aligned(space as usize, align_of::<ArenaHeader>()) {
            return Err(KmemError::PARAM_ERROR);
        }
        if (space as usize).checked_add(total_size).is_none() {
            return Err(KmemError::PARAM_ERROR);
        }

        let mut guard = self.arena.lock();
        if guard.is_some() {
            return Err(KmemError::SYSTEM_ALREADY_INITIALIZED);
        }
        if total_size < size_of::<ArenaHeader>() {
            return Err(KmemError::NOT_ENOUGH_MEMORY_TO_INIT);
        }
        let header_ptr = space.cast::<ArenaHeader>();
        if ptr::read(ptr::addr_of!((*header_ptr).magic)) == ARENA_MAGIC {
            warn!("buddy: region {space:p} already holds a live arena");
            return Err(KmemError::SYSTEM_ALREADY_INITIALIZED);
        }

        let layout = ArenaLayout::compute(space as usize, total_size, config)?;
        let total_blocks = total_size / BLOCK_SIZE;
        let table = space.add(layout.table_offset).cast::<OrderEntry>();
        let mut bitmap_cursor = space.add(layout.bitmap_offset);
        for order in 0..layout.max_order {
            let (bitmap, bitmap_bits) = if order >= layout.bitmap_min_order {
                let bits = ArenaLayout::bitmap_bits(total_blocks, order);
                let bitmap = bitmap_cursor;
                let mut bmp = SliceBitmap::<u8>::from_raw_parts(bitmap, bits);
                bmp.set_all(false);
                bitmap_cursor = bitmap_cursor.add(SliceBitmap::<u8>::bytes_for(bits));
                (bitmap, bits)
            } else {
                (ptr::null_mut(), 0)
            };
            ptr::write(
                table.add(order),
                OrderEntry {
                    free_list: IntrusiveList::new(),
                    bitmap,
                    bitmap_bits,
                },
            );
        }

        ptr::write(
            header_ptr,
            ArenaHeader {
                magic: ARENA_MAGIC,
                start: space,
                total_size,
                max_order: layout.max_order,
                bitmap_min_order: layout.bitmap_min_order,
                usable_start: space.add(layout.usable_offset),
                usable_blocks: layout.usable_blocks,
                free_blocks: 0,
                table,
            },
        );

        let mut arena = Arena {
            header: NonNull::new_unchecked(header_ptr),
        };

        // one seed block per set bit of the usable block count, largest first
        let mut offset = 0;
        for order in (0..layout.max_order).rev() {
            if layout.usable_blocks & (1 << order) != 0 {
                debug!("buddy: seed block at offset {offset}, order {order}");
                arena.push_free(offset, order);
                offset += 1 << order;
            }
        }

        debug!(
            "buddy: arena {:p}+{:#x}, max order {}, {} usable blocks from {:p}",
            space,
            total_size,
            layout.max_order,
            layout.usable_blocks,
            arena.header().usable_start
        );
        *guard = Some(arena);
        return Ok(());
    }

    /// Allocate a block large enough for `size` bytes.
    ///
    /// The block is `BLOCK_SIZE << k` bytes for the smallest fitting order `k`.
    pub fn alloc(&self, size: usize) -> KmemResult<NonNull<u8>> {
        let mut guard = self.arena.lock();
        let arena = guard.as_mut().ok_or(KmemError::SYSTEM_NOT_INITIALIZED)?;
        if size == 0 {
            return Err(KmemError::PARAM_ERROR);
        }

        let order = BlockCount::from_bytes_round_up(size).order();
        let offset = unsafe { arena.alloc_order(order)? };
        return Ok(arena.block_ptr(offset));
    }

    /// Return a block obtained from [`BuddyAllocator::alloc`].
    ///
    /// `size` must be the size passed to `alloc`; the order is recomputed
    /// from it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc(size)` on this allocator and must not be
    /// used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> KmemResult<()> {
        let mut guard = self.arena.lock();
        let arena = guard.as_mut().ok_or(KmemError::SYSTEM_NOT_INITIALIZED)?;
        if size == 0 {
            return Err(KmemError::PARAM_ERROR);
        }

        let order = BlockCount::from_bytes_round_up(size).order();
        let offset = arena.offset_of(ptr).ok_or(KmemError::PARAM_ERROR)?;
        if order >= arena.header().max_order
            || !check_aligned(offset, 1 << order)
            || !arena.fits(offset, order)
        {
            return Err(KmemError::PARAM_ERROR);
        }
        if arena.covered_by_free(offset, order) {
            warn!("buddy: double free of {ptr:p} at order {order}");
            return Err(KmemError::PARAM_ERROR);
        }

        arena.free_order(offset, order);
        return Ok(());
    }

    /// Unbind the allocator. The region's memory is left as it is, apart from
    /// the liveness tag.
    pub fn destroy(&self) -> KmemResult<()> {
        let mut guard = self.arena.lock();
        let mut arena = guard.take().ok_or(KmemError::SYSTEM_NOT_INITIALIZED)?;
        let header = arena.header_mut();
        header.magic = 0;
        debug!(
            "buddy: arena {:p}+{:#x} destroyed",
            header.start, header.total_size
        );
        return Ok(());
    }

    pub fn is_initialized(&self) -> bool {
        return self.arena.lock().is_some();
    }

    fn with_arena<R>(&self, f: impl FnOnce(&Arena) -> R) -> KmemResult<R> {
        let guard = self.arena.lock();
        let arena = guard.as_ref().ok_or(KmemError::SYSTEM_NOT_INITIALIZED)?;
        return Ok(f(arena));
    }

    /// Unit-block usage of the usable area.
    pub fn usage(&self) -> KmemResult<BlockUsage> {
        return self.with_arena(|arena| {
            let header = arena.header();
            BlockUsage::new(
                BlockCount::new(header.usable_blocks - header.free_blocks),
                BlockCount::new(header.usable_blocks),
            )
        });
    }

    /// Number of free blocks on the list of `order`.
    pub fn free_blocks(&self, order: usize) -> KmemResult<usize> {
        return self.with_arena(|arena| {
            if order >= arena.header().max_order {
                return 0;
            }
            arena.entry(order).free_list.len()
        });
    }

    /// Bit `k` is set iff the free list of order `k` is non-empty.
    pub fn free_list_mask(&self) -> KmemResult<u64> {
        return self.with_arena(|arena| {
            (0..arena.header().max_order)
                .filter(|&order| !arena.entry(order).free_list.is_empty())
                .fold(0u64, |mask, order| mask | (1 << order))
        });
    }

    /// One past the highest order.
    pub fn max_order(&self) -> KmemResult<usize> {
        return self.with_arena(|arena| arena.header().max_order);
    }

    /// Bytes of block-aligned memory handed out by the allocator.
    pub fn usable_size(&self) -> KmemResult<usize> {
        return self.with_arena(|arena| arena.header().usable_blocks * BLOCK_SIZE);
    }

    /// Config the arena was built with, after clamping.
    pub fn config(&self) -> KmemResult<BuddyConfig> {
        return self.with_arena(|arena| BuddyConfig {
            bitmap_min_order: arena.header().bitmap_min_order,
        });
    }

    /// Start of the region the allocator is bound to.
    pub fn region_start(&self) -> KmemResult<*mut u8> {
        return self.with_arena(|arena| arena.header().start);
    }
}

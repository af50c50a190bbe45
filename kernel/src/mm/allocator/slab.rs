//! Slabs and the three-state slab lists.
//!
//! A slab is one buddy block (or a power-of-two run of them) laid out as
//!
//! ```text
//! | Slab header | object bitmap | pad + colour | object 0 | object 1 | ... |
//! ```
//!
//! A set bit in the object bitmap means the slot is free.
use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use bitmap::{traits::BitMapOps, SliceBitmap};
use kmem_error::{KmemError, KmemResult};
use log::{debug, trace, warn};

use crate::libs::align::align_up;
use crate::libs::intrusive_list::{IntrusiveList, ListNode};
use crate::libs::log2::round_up_pow_of_two;
use crate::mm::allocator::block::BlockCount;
use crate::mm::allocator::buddy::BuddyAllocator;
use crate::mm::{BLOCK_SIZE, OBJECT_ALIGN};

/// Object constructor / destructor hook.
pub type ObjectHook = &'static (dyn Fn(NonNull<u8>) + Send + Sync);

/// Which list a slab sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabState {
    /// No slot taken.
    Empty,
    /// Some slots taken, some free.
    HasSpace,
    /// Every slot taken.
    Full,
}

#[repr(C)]
#[derive(Debug)]
pub struct Slab {
    prev: Option<NonNull<Slab>>,
    next: Option<NonNull<Slab>>,
    object_size: usize,
    /// bytes, a power-of-two multiple of `BLOCK_SIZE`
    slab_size: usize,
    taken_slots: usize,
    capacity: usize,
    colour: usize,
    bitmap: NonNull<u8>,
    mem_start: NonNull<u8>,
    /// `None` while unlinked
    state: Option<SlabState>,
}

impl ListNode for Slab {
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

impl Slab {
    /// Bytes of the slab that holds objects of `object_size`: one block, or
    /// the next power-of-two number of blocks when one block cannot fit a
    /// single object next to the header.
    pub fn slab_size_for(object_size: usize) -> Option<usize> {
        let min = size_of::<Slab>()
            .checked_add(1 + OBJECT_ALIGN)?
            .checked_add(object_size)?;
        if min <= BLOCK_SIZE {
            return Some(BLOCK_SIZE);
        }
        let blocks = BlockCount::from_bytes_round_up(min).data();
        if blocks > (usize::MAX / BLOCK_SIZE + 1) / 2 {
            return None;
        }
        return round_up_pow_of_two(blocks).checked_mul(BLOCK_SIZE);
    }

    /// Carve a new slab out of the buddy tier.
    ///
    /// ## Parameters
    ///
    /// - `buddy` - block source
    /// - `object_size` - size of one object slot
    /// - `ctor` - run once on every slot of the new slab
    /// - `colour_seed` - picks the colour offset, usually a running counter
    ///
    /// The slab comes back unlinked.
    pub fn get_slab(
        buddy: &BuddyAllocator,
        object_size: usize,
        ctor: Option<ObjectHook>,
        colour_seed: usize,
    ) -> KmemResult<NonNull<Slab>> {
        if object_size == 0 {
            return Err(KmemError::PARAM_ERROR);
        }
        let slab_size = Self::slab_size_for(object_size).ok_or(KmemError::PARAM_ERROR)?;
        let memory = buddy.alloc(slab_size)?;

        let base = memory.as_ptr() as usize;
        let max_slots = (slab_size - size_of::<Slab>()) / object_size;
        let bitmap_bytes = SliceBitmap::<u8>::bytes_for(max_slots);
        let objects_start = align_up(base + size_of::<Slab>() + bitmap_bytes, OBJECT_ALIGN);
        let capacity = (base + slab_size - objects_start) / object_size;
        debug_assert!(capacity >= 1 && capacity <= max_slots);

        let leftover = base + slab_size - objects_start - capacity * object_size;
        let colour = Self::colour_offset(leftover, colour_seed);

        let slab = memory.cast::<Slab>();
        unsafe {
            let bitmap = NonNull::new_unchecked(memory.as_ptr().add(size_of::<Slab>()));
            let mem_start = NonNull::new_unchecked(memory.as_ptr().add(objects_start - base + colour));
            ptr::write(
                slab.as_ptr(),
                Slab {
                    prev: None,
                    next: None,
                    object_size,
                    slab_size,
                    taken_slots: 0,
                    capacity,
                    colour,
                    bitmap,
                    mem_start,
                    state: None,
                },
            );
            (*slab.as_ptr()).bitmap_mut().set_all(true);

            if let Some(ctor) = ctor {
                let slab_ref = slab.as_ref();
                for index in 0..capacity {
                    ctor(slab_ref.object_at(index));
                }
            }
        }

        debug!(
            "slab: new slab {:p}, {} bytes, object size {}, capacity {}, colour {}",
            slab, slab_size, object_size, capacity, colour
        );
        return Ok(slab);
    }

    fn colour_offset(leftover: usize, seed: usize) -> usize {
        cfg_if::cfg_if! {
            if #[cfg(feature = "slab_coloring")] {
                use crate::mm::CACHE_LINE_SIZE;
                let slots = leftover / CACHE_LINE_SIZE + 1;
                return (seed % slots) * CACHE_LINE_SIZE;
            } else {
                let _ = (leftover, seed);
                return 0;
            }
        }
    }

    /// Return the slab's blocks to the buddy tier.
    ///
    /// `dtor` runs on every slot still taken. Fails with `SLAB_DELETE_FAIL`
    /// while the slab is linked into a list.
    ///
    /// ## Returns
    ///
    /// The number of unit blocks given back.
    ///
    /// # Safety
    ///
    /// `slab` must come from [`Slab::get_slab`] on `buddy` and must not be used
    /// once this returns `Ok`.
    pub unsafe fn delete_slab(
        slab: NonNull<Slab>,
        buddy: &BuddyAllocator,
        dtor: Option<ObjectHook>,
    ) -> KmemResult<usize> {
        let slab_ref = slab.as_ref();
        if slab_ref.state.is_some() {
            warn!("slab: refusing to delete linked slab {:p}", slab);
            return Err(KmemError::SLAB_DELETE_FAIL);
        }

        if let Some(dtor) = dtor {
            let bitmap = slab_ref.bitmap();
            for index in 0..slab_ref.capacity {
                if bitmap.get(index) == Some(false) {
                    dtor(slab_ref.object_at(index));
                }
            }
        }

        let slab_size = slab_ref.slab_size;
        buddy.free(slab.cast(), slab_size)?;
        debug!("slab: deleted slab {:p}", slab);
        return Ok(slab_size / BLOCK_SIZE);
    }

    fn bitmap(&self) -> SliceBitmap<'_, u8> {
        return unsafe { SliceBitmap::from_raw_parts(self.bitmap.as_ptr(), self.capacity) };
    }

    fn bitmap_mut(&mut self) -> SliceBitmap<'_, u8> {
        return unsafe { SliceBitmap::from_raw_parts(self.bitmap.as_ptr(), self.capacity) };
    }

    fn object_at(&self, index: usize) -> NonNull<u8> {
        return unsafe { NonNull::new_unchecked(self.mem_start.as_ptr().add(index * self.object_size)) };
    }

    fn base(&self) -> usize {
        return self as *const Slab as usize;
    }

    /// Whether `ptr` falls inside the slab's memory.
    pub fn spans(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        return addr >= self.base() && addr < self.base() + self.slab_size;
    }

    /// Take the lowest free slot.
    pub fn slab_allocate(&mut self) -> KmemResult<NonNull<u8>> {
        let mut bitmap = self.bitmap_mut();
        let index = bitmap.first_index().ok_or(KmemError::SLAB_FULL)?;
        bitmap.set(index, false);
        self.taken_slots += 1;
        return Ok(self.object_at(index));
    }

    /// Give a slot back.
    pub fn slab_free(&mut self, ptr: NonNull<u8>) -> KmemResult<()> {
        if !self.spans(ptr) {
            return Err(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB);
        }

        let addr = ptr.as_ptr() as usize;
        let start = self.mem_start.as_ptr() as usize;
        if addr < start || (addr - start) % self.object_size != 0 {
            return Err(KmemError::SLAB_DEALLOC_NOT_VALID_ADDRESS);
        }
        let index = (addr - start) / self.object_size;
        if index >= self.capacity {
            return Err(KmemError::SLAB_DEALLOC_NOT_VALID_ADDRESS);
        }

        let mut bitmap = self.bitmap_mut();
        if bitmap.set(index, true) != Some(false) {
            trace!("slab: slot {index} of {:p} freed twice", self as *const Slab);
            return Err(KmemError::SLAB_DEALLOC_NOT_VALID_ADDRESS);
        }
        self.taken_slots -= 1;
        return Ok(());
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn taken_slots(&self) -> usize {
        self.taken_slots
    }

    pub fn colour(&self) -> usize {
        self.colour
    }

    pub fn state(&self) -> Option<SlabState> {
        self.state
    }

    pub fn is_full(&self) -> bool {
        self.taken_slots == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.taken_slots == 0
    }

    /// List a slab belongs on, by occupancy.
    fn wanted_state(&self) -> SlabState {
        if self.is_empty() {
            SlabState::Empty
        } else if self.is_full() {
            SlabState::Full
        } else {
            SlabState::HasSpace
        }
    }
}

/// Occupancy summary of a set of slabs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabUsage {
    slabs: usize,
    blocks: usize,
    capacity: usize,
    in_use: usize,
    object_size: usize,
}

impl SlabUsage {
    pub fn slabs(&self) -> usize {
        self.slabs
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Object slots across all slabs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Objects currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes held by the slabs.
    pub fn total(&self) -> usize {
        self.blocks * BLOCK_SIZE
    }

    /// Bytes of free object slots.
    pub fn free(&self) -> usize {
        (self.capacity - self.in_use) * self.object_size
    }

    /// Bytes of taken object slots.
    pub fn used(&self) -> usize {
        self.in_use * self.object_size
    }

    /// Taken slots as a fraction of all slots, 0.0 with no slabs.
    pub fn utilisation(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.capacity as f64
    }
}

/// The EMPTY / HAS_SPACE / FULL lists of one size class or cache.
///
/// Every slab is on exactly one of the lists; each list is kept in address
/// order.
pub struct SlabLists {
    object_size: usize,
    empty: IntrusiveList<Slab>,
    has_space: IntrusiveList<Slab>,
    full: IntrusiveList<Slab>,
    next_colour: usize,
}

impl SlabLists {
    pub const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            empty: IntrusiveList::new(),
            has_space: IntrusiveList::new(),
            full: IntrusiveList::new(),
            next_colour: 0,
        }
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn list(&self, state: SlabState) -> &IntrusiveList<Slab> {
        match state {
            SlabState::Empty => &self.empty,
            SlabState::HasSpace => &self.has_space,
            SlabState::Full => &self.full,
        }
    }

    fn list_mut(&mut self, state: SlabState) -> &mut IntrusiveList<Slab> {
        match state {
            SlabState::Empty => &mut self.empty,
            SlabState::HasSpace => &mut self.has_space,
            SlabState::Full => &mut self.full,
        }
    }

    unsafe fn link(&mut self, mut slab: NonNull<Slab>, state: SlabState) {
        debug_assert!(slab.as_ref().state.is_none());
        self.list_mut(state).insert_ordered(slab);
        slab.as_mut().state = Some(state);
    }

    unsafe fn unlink(&mut self, mut slab: NonNull<Slab>) {
        if let Some(state) = slab.as_ref().state {
            self.list_mut(state).remove(slab);
            slab.as_mut().state = None;
        }
    }

    unsafe fn relink(&mut self, slab: NonNull<Slab>, state: SlabState) {
        if slab.as_ref().state != Some(state) {
            trace!(
                "slab: {:p} {:?} -> {:?}",
                slab,
                slab.as_ref().state,
                state
            );
            self.unlink(slab);
            self.link(slab, state);
        }
    }

    /// Hand out one object: from a HAS_SPACE slab, else from a promoted EMPTY
    /// slab, else from a fresh slab.
    ///
    /// # Safety
    ///
    /// Every slab on the lists must have come from `buddy`.
    pub unsafe fn allocate(
        &mut self,
        buddy: &BuddyAllocator,
        ctor: Option<ObjectHook>,
    ) -> KmemResult<NonNull<u8>> {
        let mut slab = match self.has_space.head() {
            Some(slab) => slab,
            None => match self.empty.head() {
                Some(slab) => {
                    self.relink(slab, SlabState::HasSpace);
                    slab
                }
                None => {
                    let slab = Slab::get_slab(buddy, self.object_size, ctor, self.next_colour)?;
                    self.next_colour = self.next_colour.wrapping_add(1);
                    self.link(slab, SlabState::HasSpace);
                    slab
                }
            },
        };

        let object = slab.as_mut().slab_allocate()?;
        if slab.as_ref().is_full() {
            self.relink(slab, SlabState::Full);
        }
        return Ok(object);
    }

    /// Slab holding `ptr`, searched on FULL then HAS_SPACE.
    pub fn find_owner(&self, ptr: NonNull<u8>) -> Option<NonNull<Slab>> {
        for state in [SlabState::Full, SlabState::HasSpace] {
            for slab in unsafe { self.list(state).iter() } {
                let slab_ref = unsafe { slab.as_ref() };
                if slab_ref.base() > ptr.as_ptr() as usize {
                    break;
                }
                if slab_ref.spans(ptr) {
                    return Some(slab);
                }
            }
        }
        None
    }

    /// Give an object back and move its slab to the list its occupancy calls for.
    ///
    /// Fails with `SLAB_DEALLOC_OBJECT_NOT_IN_SLAB` when no FULL or
    /// HAS_SPACE slab holds `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful return.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> KmemResult<()> {
        let mut slab = self
            .find_owner(ptr)
            .ok_or(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB)?;
        slab.as_mut().slab_free(ptr)?;
        let wanted = slab.as_ref().wanted_state();
        self.relink(slab, wanted);
        return Ok(());
    }

    unsafe fn release_list(
        &mut self,
        buddy: &BuddyAllocator,
        state: SlabState,
        dtor: Option<ObjectHook>,
    ) -> KmemResult<usize> {
        let mut blocks = 0;
        while let Some(slab) = self.list(state).head() {
            self.unlink(slab);
            blocks += Slab::delete_slab(slab, buddy, dtor)?;
        }
        return Ok(blocks);
    }

    /// Delete every EMPTY slab. Returns the number of blocks reclaimed.
    ///
    /// # Safety
    ///
    /// Every slab on the lists must have come from `buddy`.
    pub unsafe fn shrink(&mut self, buddy: &BuddyAllocator, dtor: Option<ObjectHook>) -> KmemResult<usize> {
        return self.release_list(buddy, SlabState::Empty, dtor);
    }

    /// Delete every slab on every list. Returns the number of blocks reclaimed.
    ///
    /// # Safety
    ///
    /// Every slab on the lists must have come from `buddy`, and no object
    /// handed out from them may be used afterwards.
    pub unsafe fn release_all(
        &mut self,
        buddy: &BuddyAllocator,
        dtor: Option<ObjectHook>,
    ) -> KmemResult<usize> {
        let mut blocks = 0;
        for state in [SlabState::Empty, SlabState::HasSpace, SlabState::Full] {
            blocks += self.release_list(buddy, state, dtor)?;
        }
        return Ok(blocks);
    }

    /// Drop every slab without touching its memory.
    pub fn forget_all(&mut self) {
        *self = Self::new(self.object_size);
    }

    pub fn slab_count(&self, state: SlabState) -> usize {
        self.list(state).len()
    }

    pub fn usage(&self) -> SlabUsage {
        let mut usage = SlabUsage {
            object_size: self.object_size,
            ..Default::default()
        };
        for state in [SlabState::Empty, SlabState::HasSpace, SlabState::Full] {
            for slab in unsafe { self.list(state).iter() } {
                let slab_ref = unsafe { slab.as_ref() };
                usage.slabs += 1;
                usage.blocks += slab_ref.slab_size / BLOCK_SIZE;
                usage.capacity += slab_ref.capacity;
                usage.in_use += slab_ref.capacity - slab_ref.bitmap().count_ones();
            }
        }
        return usage;
    }
}

impl fmt::Debug for SlabLists {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabLists")
            .field("object_size", &self.object_size)
            .field("empty", &self.empty.len())
            .field("has_space", &self.has_space.len())
            .field("full", &self.full.len())
            .finish()
    }
}

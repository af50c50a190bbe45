//! Power-of-two size classes for `kmalloc`/`kfree`.
use core::ptr::NonNull;

use kmem_error::{KmemError, KmemResult};
use log::trace;

use crate::libs::log2::ceil_log2;
use crate::libs::spinlock::SpinLock;
use crate::mm::allocator::buddy::BuddyAllocator;
use crate::mm::allocator::slab::{SlabLists, SlabUsage};
use crate::mm::{KMALLOC_BUCKETS, KMALLOC_MAX_SHIFT, KMALLOC_MIN_SHIFT};

/// Bucket serving `size` bytes.
///
/// Sizes up to `1 << KMALLOC_MIN_SHIFT` share bucket 0; `0` and sizes past
/// `1 << KMALLOC_MAX_SHIFT` have no bucket.
pub fn bucket_index(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    let shift = ceil_log2(size).max(KMALLOC_MIN_SHIFT);
    if shift > KMALLOC_MAX_SHIFT {
        return None;
    }
    return Some(shift - KMALLOC_MIN_SHIFT);
}

/// One size class and its slab lists.
pub struct Bucket {
    size: usize,
    lists: SpinLock<SlabLists>,
}

impl Bucket {
    fn new(shift: usize) -> Self {
        let size = 1 << shift;
        return Self {
            size,
            lists: SpinLock::new(SlabLists::new(size)),
        };
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn usage(&self) -> SlabUsage {
        return self.lists.lock().usage();
    }
}

/// The set of `kmalloc` buckets.
pub struct SizeClassRouter {
    buckets: [Bucket; KMALLOC_BUCKETS],
}

impl Default for SizeClassRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SizeClassRouter {
    pub fn new() -> Self {
        return Self {
            buckets: core::array::from_fn(|i| Bucket::new(i + KMALLOC_MIN_SHIFT)),
        };
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        return self.buckets.get(index);
    }

    /// Allocate an object from the bucket serving `size`.
    ///
    /// The bucket lock is held for the whole EMPTY / HAS_SPACE / FULL step.
    pub fn kmalloc(&self, buddy: &BuddyAllocator, size: usize) -> KmemResult<NonNull<u8>> {
        let index = bucket_index(size).ok_or(KmemError::PARAM_ERROR)?;
        let bucket = &self.buckets[index];
        let object = unsafe { bucket.lists.lock().allocate(buddy, None)? };
        trace!("kmalloc: {size} bytes -> {object:p} (bucket {})", bucket.size);
        return Ok(object);
    }

    /// Return an object to whichever bucket owns it.
    ///
    /// Fails with `SLAB_DEALLOC_OBJECT_NOT_IN_SLAB` when no bucket does.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful return.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) -> KmemResult<()> {
        for bucket in self.buckets.iter() {
            let mut lists = bucket.lists.lock();
            if lists.find_owner(ptr).is_some() {
                trace!("kfree: {ptr:p} (bucket {})", bucket.size);
                return lists.free(ptr);
            }
        }
        return Err(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB);
    }

    /// Give every EMPTY slab of every bucket back to `buddy`.
    pub fn shrink(&self, buddy: &BuddyAllocator) -> KmemResult<usize> {
        let mut blocks = 0;
        for bucket in self.buckets.iter() {
            blocks += unsafe { bucket.lists.lock().shrink(buddy, None)? };
        }
        return Ok(blocks);
    }

    /// Drop every slab without touching arena memory.
    pub fn forget_all(&mut self) {
        for bucket in self.buckets.iter_mut() {
            bucket.lists.get_mut().forget_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::buddy::tests::Region;
    use crate::mm::allocator::slab::SlabState;
    use crate::mm::BLOCK_SIZE;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), None);
        assert_eq!(bucket_index(1), Some(0));
        assert_eq!(bucket_index(32), Some(0));
        assert_eq!(bucket_index(33), Some(1));
        assert_eq!(bucket_index(64), Some(1));
        assert_eq!(bucket_index(4096), Some(7));
        assert_eq!(bucket_index(1 << 17), Some(12));
        assert_eq!(bucket_index((1 << 17) + 1), None);
    }

    #[test]
    fn test_bucket_sizes() {
        let router = SizeClassRouter::new();
        assert_eq!(router.bucket(0).map(Bucket::size), Some(32));
        assert_eq!(router.bucket(12).map(Bucket::size), Some(1 << 17));
        assert!(router.bucket(13).is_none());
    }

    #[test]
    fn test_kmalloc_kfree_round_trip() {
        let region = Region::new(64);
        let buddy = BuddyAllocator::new();
        unsafe { buddy.init(region.ptr(), region.size()).unwrap() };
        let router = SizeClassRouter::new();

        let small = router.kmalloc(&buddy, 20).unwrap();
        let page = router.kmalloc(&buddy, BLOCK_SIZE).unwrap();
        assert_eq!(router.kmalloc(&buddy, 0), Err(KmemError::PARAM_ERROR));
        assert_eq!(
            router.kmalloc(&buddy, (1 << 17) + 1),
            Err(KmemError::PARAM_ERROR)
        );
        assert_eq!(router.bucket(0).unwrap().usage().in_use(), 1);
        assert_eq!(router.bucket(7).unwrap().usage().in_use(), 1);

        unsafe {
            router.kfree(page).unwrap();
            router.kfree(small).unwrap();
            let mut byte = 0u8;
            assert_eq!(
                router.kfree(NonNull::from(&mut byte)),
                Err(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB)
            );
        }
        assert_eq!(
            router.bucket(0).unwrap().lists.lock().slab_count(SlabState::Empty),
            1
        );
        // bucket 0 and bucket 7 each held one slab
        assert_eq!(router.shrink(&buddy), Ok(1 + 2));
        assert_eq!(buddy.usage().unwrap().used().data(), 0);
    }
}

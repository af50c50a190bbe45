use core::fmt;
use core::ptr::NonNull;

use kmem_error::{ErrorFlags, KmemError, KmemResult};
use log::debug;

use crate::libs::spinlock::SpinLock;
use crate::mm::allocator::buddy::BuddyAllocator;
use crate::mm::allocator::slab::{ObjectHook, SlabLists, SlabUsage};
use crate::mm::CACHE_NAME_LEN;

/// Fixed-size cache name, truncated to `CACHE_NAME_LEN - 1` bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CacheName {
    bytes: [u8; CACHE_NAME_LEN],
    len: usize,
}

impl CacheName {
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(CACHE_NAME_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; CACHE_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        return Self { bytes, len };
    }

    pub fn as_str(&self) -> &str {
        // only whole UTF-8 characters are ever copied in
        return core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("");
    }
}

impl fmt::Debug for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct CacheInner {
    lists: SlabLists,
    /// outcome of the last operation, empty on success
    error_flags: ErrorFlags,
}

impl CacheInner {
    fn record<T>(&mut self, result: KmemResult<T>) -> KmemResult<T> {
        self.error_flags = match &result {
            Ok(_) => ErrorFlags::empty(),
            Err(e) => e.flag(),
        };
        return result;
    }
}

/// A named cache of equally sized objects.
///
/// `ctor` runs on every slot when a slab is carved; `dtor` runs on every
/// slot still taken when a slab is deleted. Freeing an object runs neither.
pub struct KmemCache {
    name: CacheName,
    object_size: usize,
    ctor: Option<ObjectHook>,
    dtor: Option<ObjectHook>,
    inner: SpinLock<CacheInner>,
}

impl KmemCache {
    pub fn new(
        name: &str,
        object_size: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
    ) -> Self {
        return Self {
            name: CacheName::new(name),
            object_size,
            ctor,
            dtor,
            inner: SpinLock::new(CacheInner {
                lists: SlabLists::new(object_size),
                error_flags: ErrorFlags::empty(),
            }),
        };
    }

    pub fn name(&self) -> &str {
        return self.name.as_str();
    }

    pub fn object_size(&self) -> usize {
        return self.object_size;
    }

    /// Error flags of the last operation on this cache.
    pub fn error_flags(&self) -> ErrorFlags {
        return self.inner.lock().error_flags;
    }

    /// Record `err` as this cache's last outcome.
    pub fn record_error(&self, err: KmemError) {
        self.inner.lock().error_flags = err.flag();
    }

    /// Hand out one object.
    ///
    /// # Safety
    ///
    /// Every slab of the cache must have come from `buddy`.
    pub unsafe fn alloc(&self, buddy: &BuddyAllocator) -> KmemResult<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let result = inner.lists.allocate(buddy, self.ctor);
        return inner.record(result);
    }

    /// Take an object back. The destructor does not run.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after a successful return.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> KmemResult<()> {
        let mut inner = self.inner.lock();
        let result = inner.lists.free(ptr);
        return inner.record(result);
    }

    /// Delete the EMPTY slabs and return how many blocks went back to `buddy`.
    ///
    /// # Safety
    ///
    /// Every slab of the cache must have come from `buddy`.
    pub unsafe fn shrink(&self, buddy: &BuddyAllocator) -> KmemResult<usize> {
        let mut inner = self.inner.lock();
        let result = inner.lists.shrink(buddy, self.dtor);
        return inner.record(result);
    }

    /// Delete every slab, running `dtor` on each object still taken.
    ///
    /// # Safety
    ///
    /// Every slab of the cache must have come from `buddy`; no object of the
    /// cache may be used afterwards.
    pub unsafe fn release_all(&self, buddy: &BuddyAllocator) -> KmemResult<usize> {
        let mut inner = self.inner.lock();
        let result = inner.lists.release_all(buddy, self.dtor);
        if let Ok(blocks) = result {
            debug!("kmem_cache: '{}' released {} blocks", self.name, blocks);
        }
        return inner.record(result);
    }

    /// Drop every slab without touching arena memory.
    pub fn forget_all(&mut self) {
        let inner = self.inner.get_mut();
        inner.lists.forget_all();
        inner.error_flags = ErrorFlags::empty();
    }

    pub fn usage(&self) -> SlabUsage {
        return self.inner.lock().lists.usage();
    }

    pub fn info(&self) -> CacheInfo {
        return CacheInfo {
            name: self.name,
            object_size: self.object_size,
            usage: self.usage(),
        };
    }
}

impl fmt::Debug for KmemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmemCache")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .finish()
    }
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Clone, Copy)]
pub struct CacheInfo {
    name: CacheName,
    object_size: usize,
    usage: SlabUsage,
}

impl CacheInfo {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn slabs(&self) -> usize {
        self.usage.slabs()
    }

    pub fn blocks(&self) -> usize {
        self.usage.blocks()
    }

    pub fn objects(&self) -> usize {
        self.usage.in_use()
    }

    pub fn capacity(&self) -> usize {
        self.usage.capacity()
    }

    /// Taken slots over all slots, as a percentage.
    pub fn percentage(&self) -> f64 {
        self.usage.utilisation() * 100.0
    }

    pub fn usage(&self) -> SlabUsage {
        self.usage
    }
}

impl fmt::Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache info")?;
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Object size: {}", self.object_size)?;
        writeln!(f, "Num blocks: {}", self.blocks())?;
        writeln!(f, "Number slabs: {}", self.slabs())?;
        writeln!(f, "Number objects: {}", self.objects())?;
        write!(f, "Percentage: {:.2}", self.percentage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::buddy::tests::Region;
    use std::string::ToString;

    #[test]
    fn test_cache_name_truncation() {
        assert_eq!(CacheName::new("inode").as_str(), "inode");
        let long = "a-very-long-cache-name-that-does-not-fit";
        let name = CacheName::new(long);
        assert_eq!(name.as_str().len(), CACHE_NAME_LEN - 1);
        assert!(long.starts_with(name.as_str()));

        // never split a multi-byte character
        let wide = "ééééééééééééééééé";
        assert_eq!(CacheName::new(wide).as_str().len(), 30);
    }

    #[test]
    fn test_alloc_free_flags() {
        let region = Region::new(16);
        let buddy = BuddyAllocator::new();
        unsafe { buddy.init(region.ptr(), region.size()).unwrap() };
        let cache = KmemCache::new("flags", 48, None, None);

        unsafe {
            let object = cache.alloc(&buddy).unwrap();
            assert!(cache.error_flags().is_ok());

            let mut byte = 0u8;
            assert_eq!(
                cache.free(NonNull::from(&mut byte)),
                Err(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB)
            );
            assert!(cache
                .error_flags()
                .contains_error(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB));

            cache.free(object).unwrap();
            assert!(cache.error_flags().is_ok());
            assert_eq!(cache.shrink(&buddy), Ok(1));
        }
    }

    #[test]
    fn test_info_report() {
        let region = Region::new(16);
        let buddy = BuddyAllocator::new();
        unsafe { buddy.init(region.ptr(), region.size()).unwrap() };
        let cache = KmemCache::new("report", 1024, None, None);

        unsafe {
            cache.alloc(&buddy).unwrap();
        }
        let info = cache.info();
        assert_eq!(info.name(), "report");
        assert_eq!(info.slabs(), 1);
        assert_eq!(info.blocks(), 1);
        assert_eq!(info.objects(), 1);
        assert_eq!(info.capacity(), 3);

        let text = info.to_string();
        assert!(text.contains("Name: report"));
        assert!(text.contains("Number objects: 1"));
        assert!(text.contains("Percentage: 33.33"));

        unsafe { assert_eq!(cache.release_all(&buddy), Ok(1)) };
        assert_eq!(cache.info().slabs(), 0);
    }
}

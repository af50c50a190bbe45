//! The allocator context: one buddy arena, the `kmalloc` buckets and the
//! named object caches built on top of it.
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use kmem_error::{ErrorFlags, KmemError, KmemResult};
use log::{debug, error, warn};

use crate::libs::spinlock::SpinLock;
use crate::mm::allocator::buddy::{BuddyAllocator, BuddyConfig};
use crate::mm::allocator::kmalloc::SizeClassRouter;
use crate::mm::allocator::kmem_cache::{CacheInfo, KmemCache};
use crate::mm::allocator::slab::{ObjectHook, Slab, SlabUsage};
use crate::mm::BLOCK_SIZE;

/// Name of the bootstrap cache that holds every cache control block.
const CACHE_CACHE_NAME: &str = "kmem_cache";

/// Two-tier allocator over a caller-supplied region.
///
/// `Kmem::new()` gives an empty context; [`Kmem::init`] binds it to a region.
/// All operations take `&self` and may run from several threads at once.
pub struct Kmem {
    buddy: BuddyAllocator,
    router: SizeClassRouter,
    /// control blocks of the named caches
    cache_cache: KmemCache,
    last_error: SpinLock<ErrorFlags>,
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}

impl Kmem {
    pub fn new() -> Self {
        return Self {
            buddy: BuddyAllocator::new(),
            router: SizeClassRouter::new(),
            cache_cache: KmemCache::new(CACHE_CACHE_NAME, size_of::<KmemCache>(), None, None),
            last_error: SpinLock::new(ErrorFlags::empty()),
        };
    }

    fn record<T>(&self, result: KmemResult<T>) -> KmemResult<T> {
        *self.last_error.lock() = match &result {
            Ok(_) => ErrorFlags::empty(),
            Err(e) => e.flag(),
        };
        return result;
    }

    /// Bind the context to `block_count` blocks of `BLOCK_SIZE` bytes at `space`.
    ///
    /// # Safety
    ///
    /// See [`BuddyAllocator::init_with_config`].
    pub unsafe fn init(&self, space: *mut u8, block_count: usize) -> KmemResult<()> {
        return self.init_with_config(space, block_count, BuddyConfig::default());
    }

    /// # Safety
    ///
    /// See [`BuddyAllocator::init_with_config`].
    pub unsafe fn init_with_config(
        &self,
        space: *mut u8,
        block_count: usize,
        config: BuddyConfig,
    ) -> KmemResult<()> {
        let result = match block_count.checked_mul(BLOCK_SIZE) {
            Some(total_size) => self.buddy.init_with_config(space, total_size, config),
            None => Err(KmemError::PARAM_ERROR),
        };
        if result.is_ok() {
            debug!("kmem: initialized over {block_count} blocks at {space:p}");
        }
        return self.record(result);
    }

    /// Tear the context down so it (and the region) can be initialized again.
    ///
    /// Every cache, slab and object handed out is forgotten; the region's
    /// contents are left as they are.
    pub fn destroy(&mut self) -> KmemResult<()> {
        self.router.forget_all();
        self.cache_cache.forget_all();
        let result = self.buddy.destroy();
        return self.record(result);
    }

    /// The block tier underneath.
    pub fn buddy(&self) -> &BuddyAllocator {
        return &self.buddy;
    }

    /// Error flags of the last `init`, `kmalloc`, `kfree` or `kmem_cache_create`.
    pub fn last_error(&self) -> ErrorFlags {
        return *self.last_error.lock();
    }

    /// Allocate `size` bytes from the smallest fitting size class.
    ///
    /// `None` for `size == 0`, for sizes past the largest class and when the
    /// arena is exhausted; [`Kmem::last_error`] tells which.
    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        let result = self.router.kmalloc(&self.buddy, size);
        return self.record(result).ok();
    }

    /// Return an object obtained from [`Kmem::kmalloc`].
    ///
    /// # Panics
    ///
    /// If no bucket owns `ptr`, or `ptr` is not a live object of one.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used afterwards.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        let result = self.router.kfree(ptr);
        if let Err(err) = self.record(result) {
            error!("kfree: {ptr:p} is not a live kmalloc object: {err}");
            panic!("kfree: bad pointer {ptr:p}: {err}");
        }
    }

    /// Create a named cache of `size`-byte objects.
    ///
    /// The name is cut to 31 bytes. `ctor` runs on every slot of each new
    /// slab; `dtor` on every slot still taken when a slab is deleted. On
    /// failure the error is recorded in [`Kmem::cache_cache_error`] and
    /// [`Kmem::last_error`].
    pub fn kmem_cache_create(
        &self,
        name: &str,
        size: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
    ) -> Option<CacheHandle<'_>> {
        let result = self.create_cache(name, size, ctor, dtor);
        match self.record(result) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("kmem_cache_create: '{name}' ({size} bytes) failed: {err}");
                None
            }
        }
    }

    fn create_cache(
        &self,
        name: &str,
        size: usize,
        ctor: Option<ObjectHook>,
        dtor: Option<ObjectHook>,
    ) -> KmemResult<CacheHandle<'_>> {
        if size == 0 || Slab::slab_size_for(size).is_none() {
            self.cache_cache.record_error(KmemError::PARAM_ERROR);
            return Err(KmemError::PARAM_ERROR);
        }

        let cache = unsafe { self.cache_cache.alloc(&self.buddy)? }.cast::<KmemCache>();
        unsafe { ptr::write(cache.as_ptr(), KmemCache::new(name, size, ctor, dtor)) };
        debug!(
            "kmem_cache: created '{}' ({} bytes) at {:p}",
            unsafe { cache.as_ref() }.name(),
            size,
            cache
        );
        return Ok(CacheHandle {
            cache,
            owner: self,
            _marker: PhantomData,
        });
    }

    fn cache<'h>(&self, handle: &'h CacheHandle<'_>) -> &'h KmemCache {
        assert!(
            ptr::eq(handle.owner, self),
            "cache handle used with a foreign allocator"
        );
        return unsafe { handle.cache.as_ref() };
    }

    /// Hand out one object of the cache. The cache's error flags tell why
    /// on `None`.
    pub fn kmem_cache_alloc(&self, handle: &CacheHandle<'_>) -> Option<NonNull<u8>> {
        let cache = self.cache(handle);
        return unsafe { cache.alloc(&self.buddy) }.ok();
    }

    /// Give an object back to its cache. The destructor does not run.
    ///
    /// A pointer the cache does not own is not freed; the failure lands in
    /// [`Kmem::kmem_cache_error`].
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after it has been freed.
    pub unsafe fn kmem_cache_free(&self, handle: &CacheHandle<'_>, ptr: NonNull<u8>) {
        let cache = self.cache(handle);
        if let Err(err) = cache.free(ptr) {
            warn!("kmem_cache_free: '{}' rejected {ptr:p}: {err}", cache.name());
        }
    }

    /// Delete every slab of the cache, then drop its control block.
    ///
    /// `dtor` runs on every object still allocated.
    pub fn kmem_cache_destroy(&self, handle: CacheHandle<'_>) {
        let cache = self.cache(&handle);
        if let Err(err) = unsafe { cache.release_all(&self.buddy) } {
            warn!("kmem_cache_destroy: '{}': {err}", cache.name());
        }
        debug!("kmem_cache: destroying '{}'", cache.name());

        let control = handle.cache;
        unsafe {
            ptr::drop_in_place(control.as_ptr());
            if let Err(err) = self.cache_cache.free(control.cast()) {
                panic!("kmem_cache_destroy: control block {control:p} lost: {err}");
            }
        }
    }

    /// Release the cache's EMPTY slabs. Returns the number of blocks reclaimed.
    pub fn kmem_cache_shrink(&self, handle: &CacheHandle<'_>) -> usize {
        let cache = self.cache(handle);
        return unsafe { cache.shrink(&self.buddy) }.unwrap_or(0);
    }

    pub fn kmem_cache_info(&self, handle: &CacheHandle<'_>) -> CacheInfo {
        return self.cache(handle).info();
    }

    /// Error flags of the last operation on the cache.
    pub fn kmem_cache_error(&self, handle: &CacheHandle<'_>) -> ErrorFlags {
        return self.cache(handle).error_flags();
    }

    pub fn kmem_cache_name<'h>(&self, handle: &'h CacheHandle<'_>) -> &'h str {
        return self.cache(handle).name();
    }

    /// Error flags of the bootstrap cache, set when a cache cannot be created.
    pub fn cache_cache_error(&self) -> ErrorFlags {
        return self.cache_cache.error_flags();
    }

    /// Occupancy of the bootstrap cache.
    pub fn cache_cache_info(&self) -> CacheInfo {
        return self.cache_cache.info();
    }

    /// Occupancy of `kmalloc` bucket `index` (bucket `i` serves `32 << i` bytes).
    pub fn bucket_usage(&self, index: usize) -> Option<SlabUsage> {
        return self.router.bucket(index).map(|bucket| bucket.usage());
    }

    /// Release the EMPTY slabs of every bucket and of the bootstrap cache.
    /// Returns the number of blocks reclaimed.
    pub fn shrink(&self) -> usize {
        let buckets = self.router.shrink(&self.buddy).unwrap_or(0);
        let caches = unsafe { self.cache_cache.shrink(&self.buddy) }.unwrap_or(0);
        return buckets + caches;
    }
}

/// Handle to a cache created by [`Kmem::kmem_cache_create`].
///
/// The handle borrows the `Kmem` it came from and is consumed by
/// [`Kmem::kmem_cache_destroy`]. Dropping it without destroying the cache
/// leaks the cache until [`Kmem::destroy`].
#[derive(Debug)]
pub struct CacheHandle<'k> {
    cache: NonNull<KmemCache>,
    owner: *const Kmem,
    _marker: PhantomData<&'k Kmem>,
}

// the control block is only reached through its own lock
unsafe impl Send for CacheHandle<'_> {}
unsafe impl Sync for CacheHandle<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::buddy::tests::Region;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    fn kmem_over(region: &Region) -> Kmem {
        let kmem = Kmem::new();
        unsafe { kmem.init(region.ptr(), region.size() / BLOCK_SIZE).unwrap() };
        kmem
    }

    #[test]
    fn test_init_errors() {
        let region = Region::new(8);
        let kmem = Kmem::new();
        assert_eq!(
            unsafe { kmem.init(ptr::null_mut(), 8) },
            Err(KmemError::PARAM_ERROR)
        );
        assert!(kmem.last_error().contains_error(KmemError::PARAM_ERROR));
        assert_eq!(
            unsafe { kmem.init(region.ptr(), usize::MAX) },
            Err(KmemError::PARAM_ERROR)
        );
        assert!(kmem.kmalloc(32).is_none());
        assert!(kmem
            .last_error()
            .contains_error(KmemError::SYSTEM_NOT_INITIALIZED));

        unsafe { kmem.init(region.ptr(), 8).unwrap() };
        assert!(kmem.last_error().is_ok());
        assert_eq!(
            unsafe { kmem.init(region.ptr(), 8) },
            Err(KmemError::SYSTEM_ALREADY_INITIALIZED)
        );
    }

    #[test]
    fn test_kmalloc_neighbours() {
        let region = Region::new(33);
        let kmem = kmem_over(&region);

        let a = kmem.kmalloc(32).unwrap();
        let b = kmem.kmalloc(32).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 32);
        assert!(kmem.last_error().is_ok());

        assert!(kmem.kmalloc(0).is_none());
        assert!(kmem.last_error().contains_error(KmemError::PARAM_ERROR));
        assert!(kmem.kmalloc((1 << 17) + 1).is_none());

        unsafe {
            kmem.kfree(a);
            kmem.kfree(b);
        }
        assert_eq!(kmem.bucket_usage(0).map(|u| u.in_use()), Some(0));
        assert_eq!(kmem.shrink(), 1);
        assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
    }

    #[test]
    fn test_kmalloc_exhaustion() {
        let region = Region::new(8);
        let kmem = kmem_over(&region);
        let mut objects = Vec::new();
        while let Some(object) = kmem.kmalloc(2048) {
            objects.push(object);
        }
        assert!(kmem.last_error().contains_error(KmemError::NOT_ENOUGH_MEMORY));
        assert!(!objects.is_empty());
        for object in objects {
            unsafe { kmem.kfree(object) };
        }
        assert!(kmem.shrink() > 0);
    }

    #[test]
    #[should_panic]
    fn test_kfree_foreign_pointer_panics() {
        let region = Region::new(16);
        let kmem = kmem_over(&region);
        let _object = kmem.kmalloc(64).unwrap();
        let mut local = 0u64;
        unsafe { kmem.kfree(NonNull::from(&mut local).cast()) };
    }

    static SCENARIO_CTOR: AtomicUsize = AtomicUsize::new(0);
    static SCENARIO_DTOR: AtomicUsize = AtomicUsize::new(0);

    fn scenario_ctor(object: NonNull<u8>) {
        unsafe { object.as_ptr().write_bytes(0xa5, 100) };
        SCENARIO_CTOR.fetch_add(1, Ordering::SeqCst);
    }

    fn scenario_dtor(_: NonNull<u8>) {
        SCENARIO_DTOR.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_cache_dtor_sees_only_live_objects() {
        let region = Region::new(64);
        let kmem = kmem_over(&region);
        let cache = kmem
            .kmem_cache_create("scenario", 100, Some(&scenario_ctor), Some(&scenario_dtor))
            .unwrap();
        assert_eq!(kmem.kmem_cache_name(&cache), "scenario");

        let mut objects = Vec::new();
        for _ in 0..236 {
            let object = kmem.kmem_cache_alloc(&cache).unwrap();
            assert_eq!(unsafe { *object.as_ptr() }, 0xa5);
            objects.push(object);
        }
        let unique: HashSet<usize> = objects.iter().map(|o| o.as_ptr() as usize).collect();
        assert_eq!(unique.len(), 236);

        let info = kmem.kmem_cache_info(&cache);
        assert_eq!(info.objects(), 236);
        assert_eq!(SCENARIO_CTOR.load(Ordering::SeqCst), info.capacity());

        let mut live = 0;
        for (i, object) in objects.into_iter().enumerate() {
            if i % 3 == 0 {
                unsafe { kmem.kmem_cache_free(&cache, object) };
            } else {
                live += 1;
            }
        }
        assert!(kmem.kmem_cache_error(&cache).is_ok());
        assert_eq!(kmem.kmem_cache_info(&cache).objects(), live);

        // freeing never runs the destructor
        assert_eq!(SCENARIO_DTOR.load(Ordering::SeqCst), 0);
        kmem.kmem_cache_destroy(cache);
        assert_eq!(SCENARIO_DTOR.load(Ordering::SeqCst), live);

        assert_eq!(kmem.cache_cache_info().objects(), 0);
        assert_eq!(kmem.shrink(), 1);
        assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
    }

    #[test]
    fn test_cache_free_errors_are_recorded() {
        let region = Region::new(16);
        let kmem = kmem_over(&region);
        let cache = kmem.kmem_cache_create("errors", 64, None, None).unwrap();
        let object = kmem.kmem_cache_alloc(&cache).unwrap();

        let mut local = 0u64;
        unsafe { kmem.kmem_cache_free(&cache, NonNull::from(&mut local).cast()) };
        assert!(kmem
            .kmem_cache_error(&cache)
            .contains_error(KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB));

        let inside = unsafe { NonNull::new_unchecked(object.as_ptr().add(1)) };
        unsafe { kmem.kmem_cache_free(&cache, inside) };
        assert!(kmem
            .kmem_cache_error(&cache)
            .contains_error(KmemError::SLAB_DEALLOC_NOT_VALID_ADDRESS));

        unsafe { kmem.kmem_cache_free(&cache, object) };
        assert!(kmem.kmem_cache_error(&cache).is_ok());
        assert_eq!(kmem.kmem_cache_shrink(&cache), 1);
        assert_eq!(kmem.kmem_cache_info(&cache).slabs(), 0);
        kmem.kmem_cache_destroy(cache);
    }

    #[test]
    fn test_cache_create_errors() {
        let region = Region::new(16);
        let kmem = kmem_over(&region);
        assert!(kmem.kmem_cache_create("zero", 0, None, None).is_none());
        assert!(kmem.cache_cache_error().contains_error(KmemError::PARAM_ERROR));
        assert!(kmem.last_error().contains_error(KmemError::PARAM_ERROR));

        let long = kmem
            .kmem_cache_create("a-cache-name-well-past-thirty-one-bytes", 8, None, None)
            .unwrap();
        assert_eq!(kmem.kmem_cache_name(&long), "a-cache-name-well-past-thirty-o");
        assert!(kmem.cache_cache_error().is_ok());

        // larger than the arena: creation works, allocation does not
        let huge = kmem.kmem_cache_create("huge", 1 << 20, None, None).unwrap();
        assert!(kmem.kmem_cache_alloc(&huge).is_none());
        assert!(kmem
            .kmem_cache_error(&huge)
            .contains_error(KmemError::NOT_ENOUGH_MEMORY));
        kmem.kmem_cache_destroy(huge);
        kmem.kmem_cache_destroy(long);
    }

    #[test]
    fn test_cache_create_destroy_cycle() {
        let region = Region::new(64);
        let kmem = kmem_over(&region);

        let mut caches = Vec::new();
        for i in 0..236 {
            let cache = kmem.kmem_cache_create("cycle", 16 + i % 64, None, None).unwrap();
            caches.push(cache);
        }
        assert_eq!(kmem.cache_cache_info().objects(), 236);
        let object = kmem.kmem_cache_alloc(&caches[7]).unwrap();
        unsafe { kmem.kmem_cache_free(&caches[7], object) };

        for cache in caches {
            kmem.kmem_cache_destroy(cache);
        }
        assert_eq!(kmem.cache_cache_info().objects(), 0);
        kmem.shrink();
        assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
    }

    #[test]
    fn test_destroy_and_reinit() {
        let region = Region::new(16);
        let mut kmem = kmem_over(&region);
        let _object = kmem.kmalloc(128).unwrap();
        let cache = kmem.kmem_cache_create("leaked", 32, None, None).unwrap();
        kmem.kmem_cache_alloc(&cache).unwrap();
        drop(cache);

        kmem.destroy().unwrap();
        assert!(!kmem.buddy().is_initialized());
        assert_eq!(kmem.destroy(), Err(KmemError::SYSTEM_NOT_INITIALIZED));
        assert_eq!(kmem.bucket_usage(2).map(|u| u.slabs()), Some(0));
        assert_eq!(kmem.cache_cache_info().slabs(), 0);

        unsafe { kmem.init(region.ptr(), 16).unwrap() };
        assert!(kmem.kmalloc(128).is_some());
    }

    #[test]
    #[should_panic]
    fn test_handle_from_other_context_panics() {
        let region = Region::new(16);
        let other_region = Region::new(16);
        let kmem = kmem_over(&region);
        let other = kmem_over(&other_region);
        let cache = kmem.kmem_cache_create("mine", 32, None, None).unwrap();
        other.kmem_cache_alloc(&cache);
    }

    #[test]
    fn test_threads_share_context() {
        let region = Region::new(256);
        let kmem = kmem_over(&region);
        let cache = kmem.kmem_cache_create("shared", 200, None, None).unwrap();

        std::thread::scope(|s| {
            for t in 0..4 {
                let kmem = &kmem;
                let cache = &cache;
                s.spawn(move || {
                    for round in 0..50 {
                        let mut objects = Vec::new();
                        for i in 0..16 {
                            let size = 16 << ((t + round + i) % 8);
                            let object = kmem.kmalloc(size).unwrap();
                            unsafe { object.as_ptr().write_bytes(t as u8, size) };
                            objects.push((object, size));
                        }
                        let cached = kmem.kmem_cache_alloc(cache).unwrap();
                        for (object, size) in objects {
                            let bytes =
                                unsafe { core::slice::from_raw_parts(object.as_ptr(), size) };
                            assert!(bytes.iter().all(|&b| b == t as u8));
                            unsafe { kmem.kfree(object) };
                        }
                        unsafe { kmem.kmem_cache_free(cache, cached) };
                    }
                });
            }
        });

        for index in 0..8 {
            assert_eq!(kmem.bucket_usage(index).map(|u| u.in_use()), Some(0));
        }
        assert_eq!(kmem.kmem_cache_info(&cache).objects(), 0);
        kmem.kmem_cache_destroy(cache);
        kmem.shrink();
        assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
    }
}

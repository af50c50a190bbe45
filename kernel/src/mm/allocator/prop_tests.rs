use proptest::prelude::*;

use crate::mm::allocator::buddy::tests::Region;
use crate::mm::allocator::buddy::{BuddyAllocator, BuddyConfig};
use crate::mm::kmem::Kmem;
use crate::mm::BLOCK_SIZE;

/// Random alloc/free sequences over a real arena: nothing may overlap, and
/// once everything is freed the arena must be back in its seeded shape.
mod prop {
    use super::*;
    use core::ptr::NonNull;
    use kmem_error::KmemError;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::vec::Vec;

    fn free_lists(buddy: &BuddyAllocator) -> Vec<usize> {
        let max_order = buddy.max_order().unwrap();
        (0..max_order)
            .map(|order| buddy.free_blocks(order).unwrap())
            .collect()
    }

    fn overlaps(live: &[(NonNull<u8>, usize)], ptr: NonNull<u8>, size: usize) -> bool {
        let start = ptr.as_ptr() as usize;
        live.iter().any(|&(other, other_size)| {
            let other_start = other.as_ptr() as usize;
            start < other_start + other_size && other_start < start + size
        })
    }

    proptest! {
        // keep the run short
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn prop_buddy_alloc_free_restores_lists(
            seed in any::<u64>(),
            blocks in 8usize..300usize,
            bitmap_min_order in 0usize..3usize,
            ops in 100usize..1000usize,
        ) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let region = Region::new(blocks);
            let buddy = BuddyAllocator::new();
            let config = BuddyConfig { bitmap_min_order };
            unsafe { buddy.init_with_config(region.ptr(), region.size(), config).unwrap() };
            let seeded = free_lists(&buddy);

            let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
            for _ in 0..ops {
                if live.is_empty() || rng.gen_bool(0.55) {
                    let size = rng.gen_range(1..=8 * BLOCK_SIZE);
                    match buddy.alloc(size) {
                        Ok(ptr) => {
                            let span = size.next_power_of_two().max(BLOCK_SIZE);
                            prop_assert!(!overlaps(&live, ptr, span));
                            prop_assert_eq!(ptr.as_ptr() as usize % BLOCK_SIZE, 0);
                            live.push((ptr, span));
                        }
                        Err(err) => {
                            prop_assert_eq!(err, KmemError::NOT_ENOUGH_MEMORY);
                        }
                    }
                } else {
                    let (ptr, span) = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { buddy.free(ptr, span).unwrap() };
                }
            }

            for (ptr, span) in live.drain(..) {
                unsafe { buddy.free(ptr, span).unwrap() };
            }
            prop_assert_eq!(free_lists(&buddy), seeded);
            prop_assert_eq!(buddy.usage().unwrap().used().data(), 0);
        }

        #[test]
        fn prop_kmalloc_random_sequence(seed in any::<u64>(), ops in 200usize..2000usize) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let region = Region::new(128);
            let kmem = Kmem::new();
            unsafe { kmem.init(region.ptr(), 128).unwrap() };
            let seeded = free_lists(kmem.buddy());

            let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
            for _ in 0..ops {
                if live.is_empty() || rng.gen_bool(0.60) {
                    let size = rng.gen_range(1..=4096usize);
                    if let Some(ptr) = kmem.kmalloc(size) {
                        prop_assert!(!overlaps(&live, ptr, size));
                        unsafe { ptr.as_ptr().write_bytes(0x5a, size) };
                        live.push((ptr, size));
                    } else {
                        prop_assert!(kmem.last_error().contains_error(KmemError::NOT_ENOUGH_MEMORY));
                    }
                } else {
                    let (ptr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { kmem.kfree(ptr) };
                }

                // now and then give EMPTY slabs back, as under memory pressure
                if rng.gen_bool(0.05) {
                    kmem.shrink();
                }
            }

            for (ptr, _) in live.drain(..) {
                unsafe { kmem.kfree(ptr) };
            }
            kmem.shrink();
            prop_assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
            prop_assert_eq!(free_lists(kmem.buddy()), seeded);
        }

        #[test]
        fn prop_cache_random_sequence(
            seed in any::<u64>(),
            size in 1usize..3000usize,
            ops in 100usize..1000usize,
        ) {
            let mut rng = SmallRng::seed_from_u64(seed);
            let region = Region::new(96);
            let kmem = Kmem::new();
            unsafe { kmem.init(region.ptr(), 96).unwrap() };

            let cache = kmem.kmem_cache_create("prop", size, None, None).unwrap();
            let mut live: Vec<NonNull<u8>> = Vec::new();
            for _ in 0..ops {
                if live.is_empty() || rng.gen_bool(0.60) {
                    if let Some(ptr) = kmem.kmem_cache_alloc(&cache) {
                        prop_assert!(!live.contains(&ptr));
                        live.push(ptr);
                    }
                } else {
                    let ptr = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { kmem.kmem_cache_free(&cache, ptr) };
                    prop_assert!(kmem.kmem_cache_error(&cache).is_ok());
                }
                prop_assert_eq!(kmem.kmem_cache_info(&cache).objects(), live.len());
            }

            kmem.kmem_cache_destroy(cache);
            kmem.shrink();
            prop_assert_eq!(kmem.buddy().usage().unwrap().used().data(), 0);
        }
    }
}

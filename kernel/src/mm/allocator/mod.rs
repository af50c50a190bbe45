pub mod block;
pub mod buddy;
pub mod kmalloc;
pub mod kmem_cache;
pub mod slab;

#[cfg(test)]
mod prop_tests;

pub mod align;
pub mod intrusive_list;
pub mod log2;
pub mod spinlock;

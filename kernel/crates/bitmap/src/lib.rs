#![no_std]
#![allow(clippy::needless_return)]

mod bitmap_core;
mod slice_bitmap;
pub mod traits;
pub use slice_bitmap::SliceBitmap;

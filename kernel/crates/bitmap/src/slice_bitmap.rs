use core::mem::size_of;

use crate::{bitmap_core::BitMapCore, traits::BitMapOps, traits::BitOps};

/// A bitmap over borrowed word storage.
///
/// The storage is not owned: it may live inside a memory region managed by
/// someone else (for example the header area of an allocator arena), so the
/// bitmap can be rebuilt from a raw pointer whenever it is needed.
#[derive(Debug)]
pub struct SliceBitmap<'a, T: BitOps> {
    data: &'a mut [T],
    len: usize,
    core: BitMapCore<T>,
}

impl<'a, T: BitOps> SliceBitmap<'a, T> {
    /// Number of `T` words needed to hold `bits` bits.
    pub const fn words_for(bits: usize) -> usize {
        let word_bits = size_of::<T>() * 8;
        (bits + word_bits - 1) / word_bits
    }

    /// Number of bytes needed to hold `bits` bits.
    pub const fn bytes_for(bits: usize) -> usize {
        Self::words_for(bits) * size_of::<T>()
    }

    /// Wrap `data` as a bitmap of `len` bits.
    ///
    /// ## Returns
    ///
    /// - `Some(bitmap)` - `data` is large enough
    /// - `None` - `data` has fewer than `words_for(len)` words
    pub fn new(data: &'a mut [T], len: usize) -> Option<Self> {
        if data.len() < Self::words_for(len) {
            return None;
        }

        return Some(Self {
            data,
            len,
            core: BitMapCore::new(),
        });
    }

    /// Build a bitmap of `len` bits over raw storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `words_for(len)` words for
    /// `'a`, and nothing else may access that storage while the bitmap lives.
    pub unsafe fn from_raw_parts(ptr: *mut T, len: usize) -> Self {
        return Self {
            data: core::slice::from_raw_parts_mut(ptr, Self::words_for(len)),
            len,
            core: BitMapCore::new(),
        };
    }

    /// Iterate over the indices of set bits, lowest first.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.first_index();
        core::iter::from_fn(move || {
            let current = next?;
            next = self.next_index(current);
            Some(current)
        })
    }
}

impl<T: BitOps> BitMapOps<T> for SliceBitmap<'_, T> {
    #[inline]
    fn get(&self, index: usize) -> Option<bool> {
        return self.core.get(self.len, self.data, index);
    }

    #[inline]
    fn set(&mut self, index: usize, value: bool) -> Option<bool> {
        return self.core.set(self.len, self.data, index, value);
    }

    fn set_all(&mut self, value: bool) {
        self.core.set_all(self.len, self.data, value);
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn size(&self) -> usize {
        self.data.len() * size_of::<T>()
    }

    #[inline]
    fn first_index(&self) -> Option<usize> {
        self.core.first_index(self.len, self.data)
    }

    #[inline]
    fn next_index(&self, index: usize) -> Option<usize> {
        self.core.next_index(self.len, self.data, index)
    }

    #[inline]
    fn count_ones(&self) -> usize {
        self.core.count_ones(self.len, self.data)
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.core.is_full(self.len, self.data)
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.core.is_empty(self.len, self.data)
    }
}

use core::ops::{BitAnd, BitAndAssign, BitOrAssign, Not};

/// Word-level bit operations a bitmap is built from.
pub trait BitOps:
    BitAndAssign + Sized + Copy + PartialEq + Not<Output = Self> + BitOrAssign + BitAnd<Output = Self>
{
    fn get(bits: &Self, index: usize) -> bool;
    fn set(bits: &mut Self, index: usize, value: bool) -> bool;
    fn count_ones(bits: &Self) -> usize;
    fn first_index(bits: &Self) -> Option<usize>;
    fn next_index(bits: &Self, index: usize) -> Option<usize>;
    fn make_mask(shift: usize) -> Self;
    fn bit_size() -> usize;
    fn zero() -> Self;
    fn max() -> Self;
}

macro_rules! bitops_for {
    ($target:ty) => {
        impl BitOps for $target {
            #[inline]
            fn get(bits: &Self, index: usize) -> bool {
                bits & (1 << index) != 0
            }

            #[inline]
            fn set(bits: &mut Self, index: usize, value: bool) -> bool {
                let mask = 1 << index;
                let prev = *bits & mask;
                if value {
                    *bits |= mask;
                } else {
                    *bits &= !mask;
                }
                prev != 0
            }

            #[inline]
            fn count_ones(bits: &Self) -> usize {
                bits.count_ones() as usize
            }

            #[inline]
            fn first_index(bits: &Self) -> Option<usize> {
                if *bits == 0 {
                    None
                } else {
                    Some(bits.trailing_zeros() as usize)
                }
            }

            #[inline]
            fn next_index(bits: &Self, index: usize) -> Option<usize> {
                if *bits == 0 || index >= <$target>::BITS as usize - 1 {
                    None
                } else {
                    let intermediate = *bits & (<$target>::MAX.overflowing_shl(1 + index as u32).0);

                    if intermediate == 0 {
                        None
                    } else {
                        Some(intermediate.trailing_zeros() as usize)
                    }
                }
            }

            #[inline]
            fn make_mask(shift: usize) -> Self {
                if shift == <$target>::BITS as usize {
                    <$target>::MAX
                } else {
                    (1 << shift) - 1
                }
            }

            #[inline]
            fn bit_size() -> usize {
                <$target>::BITS as usize
            }

            #[inline]
            fn zero() -> Self {
                0
            }

            #[inline]
            fn max() -> Self {
                <$target>::MAX
            }
        }
    };
}

bitops_for!(u8);
bitops_for!(u16);
bitops_for!(u32);
bitops_for!(u64);
bitops_for!(usize);

/// Operations every bitmap exposes.
pub trait BitMapOps<T: BitOps> {
    /// Read the bit at `index`.
    ///
    /// ## Returns
    ///
    /// - `Some(true)` / `Some(false)` - the bit value
    /// - `None` - `index` is out of range
    fn get(&self, index: usize) -> Option<bool>;

    /// Write the bit at `index` and return its previous value.
    ///
    /// ## Parameters
    ///
    /// - `index` - bit index
    /// - `value` - new bit value
    ///
    /// ## Returns
    ///
    /// - `Some(prev)` - the value the bit held before
    /// - `None` - `index` is out of range
    fn set(&mut self, index: usize, value: bool) -> Option<bool>;

    /// Set every valid bit to `value`. Padding bits past `len()` stay clear.
    fn set_all(&mut self, value: bool);

    /// Number of valid bits.
    fn len(&self) -> usize;

    /// Storage size in bytes.
    fn size(&self) -> usize;

    /// Index of the lowest set bit.
    fn first_index(&self) -> Option<usize>;

    /// Index of the first set bit strictly after `index`.
    fn next_index(&self, index: usize) -> Option<usize>;

    /// Number of set bits.
    fn count_ones(&self) -> usize;

    /// Every valid bit is set.
    fn is_full(&self) -> bool;

    /// No bit is set.
    fn is_empty(&self) -> bool;
}

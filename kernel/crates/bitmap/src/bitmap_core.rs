use core::marker::PhantomData;

use crate::traits::BitOps;

/// Word-array algorithms shared by the bitmap front-ends.
///
/// `n` is always the number of valid bits; bits past `n` in the last word are padding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BitMapCore<T: BitOps> {
    phantom: PhantomData<T>,
}

impl<T: BitOps> BitMapCore<T> {
    pub const fn new() -> Self {
        Self {
            phantom: PhantomData,
        }
    }

    pub(crate) fn get(&self, n: usize, data: &[T], index: usize) -> Option<bool> {
        if index >= n {
            return None;
        }

        let element = data.get(index / T::bit_size())?;
        Some(<T as BitOps>::get(element, index % T::bit_size()))
    }

    pub(crate) fn set(&self, n: usize, data: &mut [T], index: usize, value: bool) -> Option<bool> {
        if index >= n {
            return None;
        }

        let element = data.get_mut(index / T::bit_size())?;
        Some(<T as BitOps>::set(element, index % T::bit_size(), value))
    }

    pub(crate) fn set_all(&self, n: usize, data: &mut [T], value: bool) {
        let val = if value { T::max() } else { T::zero() };
        for element in data.iter_mut() {
            *element = val;
        }

        // clear the padding of the last word
        if let Some(last_element) = data.last_mut() {
            let mask = T::make_mask(n % T::bit_size());
            if mask != T::zero() {
                *last_element &= mask;
            }
        }
    }

    pub(crate) fn first_index(&self, n: usize, data: &[T]) -> Option<usize> {
        for (i, element) in data.iter().enumerate() {
            if let Some(bit) = <T as BitOps>::first_index(element) {
                return self.make_index(n, i * T::bit_size() + bit);
            }
        }

        None
    }

    pub(crate) fn next_index(&self, n: usize, data: &[T], index: usize) -> Option<usize> {
        if index >= n {
            return None;
        }

        let element_index = index / T::bit_size();
        let bit_index = index % T::bit_size();

        let element = data.get(element_index)?;
        if let Some(bit) = <T as BitOps>::next_index(element, bit_index) {
            return self.make_index(n, element_index * T::bit_size() + bit);
        }

        for (i, element) in data.iter().enumerate().skip(element_index + 1) {
            if let Some(bit) = <T as BitOps>::first_index(element) {
                return self.make_index(n, i * T::bit_size() + bit);
            }
        }

        None
    }

    pub(crate) fn count_ones(&self, n: usize, data: &[T]) -> usize {
        let words = n.div_ceil(T::bit_size());
        let tail_mask = T::make_mask(n % T::bit_size());
        return data
            .iter()
            .take(words)
            .enumerate()
            .map(|(i, element)| {
                let mut element = *element;
                if i + 1 == words && tail_mask != T::zero() {
                    element &= tail_mask;
                }
                <T as BitOps>::count_ones(&element)
            })
            .sum();
    }

    pub(crate) fn is_full(&self, n: usize, data: &[T]) -> bool {
        return n > 0 && self.count_ones(n, data) == n;
    }

    pub(crate) fn is_empty(&self, n: usize, data: &[T]) -> bool {
        return self.count_ones(n, data) == 0;
    }

    fn make_index(&self, n: usize, index: usize) -> Option<usize> {
        if index >= n {
            return None;
        }

        Some(index)
    }
}

/// Round up to the nearest power of two.
///
/// - round_up_pow_of_two(5) = 8
/// - round_up_pow_of_two(8) = 8
/// - round_up_pow_of_two(33) = 64
#[inline]
pub const fn round_up_pow_of_two(n: usize) -> usize {
    if n < 2 {
        return 1;
    }

    1usize << (usize::BITS - (n - 1).leading_zeros())
}

#[inline]
pub const fn is_power_of_two(n: usize) -> bool {
    n > 0 && (n & (n - 1)) == 0
}

/// Smallest `k` with `2^k >= n`. `ceil_log2(0) == ceil_log2(1) == 0`.
#[inline]
pub const fn ceil_log2(n: usize) -> usize {
    if n < 2 {
        return 0;
    }

    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// Largest `k` with `2^k <= n`. `n` must be non-zero.
#[inline]
pub const fn floor_log2(n: usize) -> usize {
    assert!(n != 0);
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

//! Address alignment helpers. `align` must always be a power of two.

#[inline]
pub const fn align_up(addr: usize, align: usize) -> usize {
    assert!(align != 0 && align.is_power_of_two());
    let align_mask = align - 1;
    if addr & align_mask == 0 {
        addr
    } else {
        (addr | align_mask) + 1
    }
}

#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    assert!(align != 0 && align.is_power_of_two());
    addr & !(align - 1)
}

#[inline]
pub const fn check_aligned(x: usize, align: usize) -> bool {
    assert!(align != 0 && align.is_power_of_two());
    x & (align - 1) == 0
}

/// `ceil(x / unit)`.
#[inline]
pub const fn div_round_up(x: usize, unit: usize) -> usize {
    x.div_ceil(unit)
}

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

use crate::libs::align::div_round_up;
use crate::libs::log2::ceil_log2;
use crate::mm::BLOCK_SIZE;

/// A number of unit blocks.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
#[repr(transparent)]
pub struct BlockCount(usize);

impl BlockCount {
    pub const fn new(count: usize) -> Self {
        return Self(count);
    }

    pub fn data(&self) -> usize {
        return self.0;
    }

    /// Bytes covered by this many blocks.
    pub fn bytes(&self) -> usize {
        return self.0 * BLOCK_SIZE;
    }

    /// Blocks needed to hold `bytes` bytes, rounded up.
    pub fn from_bytes_round_up(bytes: usize) -> Self {
        return Self(div_round_up(bytes, BLOCK_SIZE));
    }

    /// Exact conversion; `None` if `bytes` is not a whole number of blocks.
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        if bytes % BLOCK_SIZE != 0 {
            return None;
        }
        return Some(Self(bytes / BLOCK_SIZE));
    }

    /// Smallest order whose block holds this many unit blocks.
    pub fn order(&self) -> usize {
        return ceil_log2(self.0);
    }

    /// Unit blocks in one block of `order`.
    pub const fn of_order(order: usize) -> Self {
        return Self(1 << order);
    }
}

impl Add for BlockCount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for BlockCount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for BlockCount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for BlockCount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// Block usage of a buddy arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockUsage {
    used: BlockCount,
    total: BlockCount,
}

impl BlockUsage {
    pub fn new(used: BlockCount, total: BlockCount) -> Self {
        return Self { used, total };
    }

    pub fn used(&self) -> BlockCount {
        return self.used;
    }

    pub fn free(&self) -> BlockCount {
        return self.total - self.used;
    }

    pub fn total(&self) -> BlockCount {
        return self.total;
    }
}

impl fmt::Display for BlockUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} blocks used ({} free)",
            self.used.data(),
            self.total.data(),
            self.free().data()
        )
    }
}

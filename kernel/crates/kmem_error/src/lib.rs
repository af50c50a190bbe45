#![no_std]
#![allow(clippy::needless_return)]
#![allow(clippy::upper_case_acronyms)]

use core::fmt;

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};

/// Error codes of the block and object allocators.
///
/// Every code is a distinct bit so that several failures can be accumulated
/// in one [`ErrorFlags`] word. Success (code 0) is `Ok(..)` and has no variant.
#[repr(u32)]
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[allow(non_camel_case_types)]
pub enum KmemError {
    /// Null region, zero size or an argument out of range.
    PARAM_ERROR = 1,
    /// No free block (or slab) can satisfy the request.
    NOT_ENOUGH_MEMORY = 2,
    /// The region cannot hold the allocator metadata plus one block.
    NOT_ENOUGH_MEMORY_TO_INIT = 4,
    /// The allocator context has not been initialized.
    SYSTEM_NOT_INITIALIZED = 8,
    /// The allocator context (or the region) is already live.
    SYSTEM_ALREADY_INITIALIZED = 16,
    /// Every slot of the slab is taken.
    SLAB_FULL = 32,
    /// The pointer lies outside the slab's object storage.
    SLAB_DEALLOC_OBJECT_NOT_IN_SLAB = 64,
    /// The pointer is not on an object boundary, or the slot is already free.
    SLAB_DEALLOC_NOT_VALID_ADDRESS = 128,
    /// The slab is still linked into a list.
    SLAB_DELETE_FAIL = 256,
    /// Generic failure.
    FAIL = 512,
}

pub type KmemResult<T> = Result<T, KmemError>;

impl KmemError {
    /// Decode a numeric code. `0` (success) and unknown codes give `None`.
    pub fn from_code(code: u32) -> Option<KmemError> {
        return <Self as num_traits::FromPrimitive>::from_u32(code);
    }

    /// Numeric bitmask value of the error.
    pub fn code(&self) -> u32 {
        return <Self as num_traits::ToPrimitive>::to_u32(self).unwrap_or(Self::FAIL as u32);
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KmemError::PARAM_ERROR => "invalid parameter",
            KmemError::NOT_ENOUGH_MEMORY => "not enough memory",
            KmemError::NOT_ENOUGH_MEMORY_TO_INIT => "not enough memory to initialize",
            KmemError::SYSTEM_NOT_INITIALIZED => "allocator not initialized",
            KmemError::SYSTEM_ALREADY_INITIALIZED => "allocator already initialized",
            KmemError::SLAB_FULL => "slab is full",
            KmemError::SLAB_DEALLOC_OBJECT_NOT_IN_SLAB => "object does not belong to the slab",
            KmemError::SLAB_DEALLOC_NOT_VALID_ADDRESS => "not a valid object address",
            KmemError::SLAB_DELETE_FAIL => "slab is still linked",
            KmemError::FAIL => "operation failed",
        }
    }

    /// The error as a single-bit flag set.
    pub fn flag(&self) -> ErrorFlags {
        return ErrorFlags::from_bits_truncate(self.code());
    }
}

impl fmt::Display for KmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.as_str(), self.code())
    }
}

bitflags! {
    /// Accumulated error state. The empty set means no error was recorded.
    #[derive(Default)]
    pub struct ErrorFlags: u32 {
        const PARAM_ERROR = 1;
        const NOT_ENOUGH_MEMORY = 2;
        const NOT_ENOUGH_MEMORY_TO_INIT = 4;
        const SYSTEM_NOT_INITIALIZED = 8;
        const SYSTEM_ALREADY_INITIALIZED = 16;
        const SLAB_FULL = 32;
        const SLAB_DEALLOC_OBJECT_NOT_IN_SLAB = 64;
        const SLAB_DEALLOC_NOT_VALID_ADDRESS = 128;
        const SLAB_DELETE_FAIL = 256;
        const FAIL = 512;
    }
}

impl ErrorFlags {
    pub fn is_ok(&self) -> bool {
        return self.is_empty();
    }

    pub fn record(&mut self, err: KmemError) {
        self.insert(err.flag());
    }

    pub fn contains_error(&self, err: KmemError) -> bool {
        return self.contains(err.flag());
    }

    /// Iterate over the recorded errors, lowest code first.
    pub fn errors(&self) -> impl Iterator<Item = KmemError> {
        let bits = self.bits();
        return (0..u32::BITS)
            .map(|shift| 1u32 << shift)
            .filter(move |bit| bits & bit != 0)
            .filter_map(KmemError::from_code);
    }
}

impl From<KmemError> for ErrorFlags {
    fn from(err: KmemError) -> Self {
        err.flag()
    }
}

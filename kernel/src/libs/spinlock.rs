use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use core::sync::atomic::{AtomicBool, Ordering};

use kmem_error::KmemError;

/// Raw spinlock.
///
/// The inner `AtomicBool` is `false` while unlocked and `true` while held.
#[derive(Debug)]
pub struct RawSpinlock(AtomicBool);

impl RawSpinlock {
    /// @brief Unlocked initial value
    pub const INIT: RawSpinlock = RawSpinlock(AtomicBool::new(false));

    /// @brief Spin until the lock is taken
    pub fn lock(&self) {
        while !self.try_lock() {
            while self.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    /// @brief Try to take the lock once
    /// @return true if the lock was taken
    pub fn try_lock(&self) -> bool {
        return self
            .0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
    }

    /// @brief Release the lock
    pub fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// @brief Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        return self.0.load(Ordering::Relaxed);
    }
}

/// A spinlock protecting `T`, accessed through a guard.
///
/// The lock may live inside an arena-managed control block; it never
/// allocates.
pub struct SpinLock<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

/// Only `SpinLock::lock`/`try_lock` hand out guards, so holding one means the
/// data is protected.
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        return Self {
            lock: RawSpinlock::INIT,
            data: UnsafeCell::new(value),
        };
    }

    #[inline(always)]
    pub fn lock(&self) -> SpinLockGuard<T> {
        self.lock.lock();
        return SpinLockGuard { lock: self };
    }

    /// Take the lock without spinning.
    ///
    /// Fails with `KmemError::FAIL` when the lock is held elsewhere.
    pub fn try_lock(&self) -> Result<SpinLockGuard<T>, KmemError> {
        if self.lock.try_lock() {
            return Ok(SpinLockGuard { lock: self });
        }
        return Err(KmemError::FAIL);
    }

    pub fn is_locked(&self) -> bool {
        return self.lock.is_locked();
    }

    /// Access the data through an exclusive reference, no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        return self.data.get_mut();
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Ok(guard) => f.debug_struct("SpinLock").field("data", &*guard).finish(),
            Err(_) => f.debug_struct("SpinLock").field("data", &"<locked>").finish(),
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        return unsafe { &*self.lock.data.get() };
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        return unsafe { &mut *self.lock.data.get() };
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.unlock();
    }
}

//! A mutex that is safe to use from inside a global allocator.
//!
//! `std::sync::Mutex` is fine on Linux today, but nothing promises it stays
//! allocation-free, and poisoning is useless to us. This is the classic
//! three-state futex lock (unlocked, locked, locked with waiters): the fast
//! path is a single CAS in userspace, and we only enter the kernel when there
//! is contention.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering,
};

use linux_futex::{Futex, Private};

const UNLOCKED: u32 = 0;

const LOCKED: u32 = 1;

/// Locked, and somebody may be sleeping on the futex
const CONTENDED: u32 = 2;

pub struct FutexMutex<T> {
    futex: Futex<Private>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `futex`, exactly like
// `std::sync::Mutex`.
unsafe impl<T: Send> Send for FutexMutex<T> {}
unsafe impl<T: Send> Sync for FutexMutex<T> {}

impl<T> FutexMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            futex: Futex::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, sleeping on the futex while another thread holds it.
    pub fn lock(&self) -> FutexMutexGuard<'_, T> {
        if self
            .futex
            .value
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        FutexMutexGuard { mutex: self }
    }

    /// Acquire the lock only if it is free right now.
    #[cfg(test)]
    pub(crate) fn try_lock(&self) -> Option<FutexMutexGuard<'_, T>> {
        self.futex
            .value
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FutexMutexGuard { mutex: self })
    }

    #[cold]
    fn lock_contended(&self) {
        // Once we've been here, we can't know whether other waiters exist, so
        // we always take the lock as CONTENDED and pay for a wake on unlock.
        while self.futex.value.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            // Spurious wakeups and EAGAIN (value already changed) both just
            // mean "try again".
            _ = self.futex.wait(CONTENDED);
        }
    }

    /// Release a lock whose guard was forgotten.
    ///
    /// # Safety
    ///
    /// The lock must be held, and the thread that took it must not touch the
    /// data again without locking.
    #[cfg(feature = "interpose")]
    pub(crate) unsafe fn force_unlock(&self) {
        self.unlock();
    }

    fn unlock(&self) {
        if self.futex.value.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.futex.wake(1);
        }
    }

    /// Exclusive access without locking, we are the only owner anyway.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct FutexMutexGuard<'a, T> {
    mutex: &'a FutexMutex<T>,
}

impl<T> Deref for FutexMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for FutexMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means we hold the lock, and `&mut self`
        // means this is the only live reference through the guard
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for FutexMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

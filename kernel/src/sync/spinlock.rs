//! IRQ-safe spinlock with automatic interrupt disable/restore.
//!
//! Disables interrupts before acquiring the lock and restores the previous
//! interrupt state on drop. On a uniprocessor this is what prevents a timer
//! IRQ handler from spinning forever on a lock its own CPU already holds.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// An IRQ-safe spinlock protecting data of type `T`.
///
/// Held regions must not call code that blocks or performs page allocation
/// that may block.
pub struct SpinLock<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the atomic flag serializes all access to `data`; interrupts are
// disabled for the full hold time, so IRQ handlers cannot re-enter.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

/// RAII guard for a held [`SpinLock`].
///
/// Releases the lock and restores the interrupt state that was saved at
/// acquisition time when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock wrapping the given data.
    pub const fn new(data: T) -> Self {
        SpinLock {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    ///
    /// Interrupts are disabled before the first acquisition attempt so an
    /// IRQ arriving mid-spin cannot deadlock against us.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let was_enabled = crate::arch::interrupts_enabled();
        crate::arch::disable_interrupts();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.lock.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled: was_enabled,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Restores the interrupt state on failure.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let was_enabled = crate::arch::interrupts_enabled();
        crate::arch::disable_interrupts();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                irq_was_enabled: was_enabled,
            })
        } else {
            if was_enabled {
                crate::arch::enable_interrupts();
            }
            None
        }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> SpinLockGuard<'_, T> {
    /// Release the lock WITHOUT restoring the saved interrupt state.
    ///
    /// Interrupts remain disabled after this call. Used by the scheduler to
    /// keep interrupts off from queue manipulation through the context
    /// switch itself.
    pub fn release_without_irq_restore(self) {
        self.lock.lock.store(false, Ordering::Release);
        core::mem::forget(self); // skip Drop, which would restore IF
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
        // Restore interrupt state AFTER releasing the lock. Nested guards
        // compose: inner guards observe IF=0 and restore IF=0; only the
        // outermost guard re-enables.
        if self.irq_was_enabled {
            crate::arch::enable_interrupts();
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = SpinLock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn release_without_restore_frees_the_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        guard.release_without_irq_restore();
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }
}

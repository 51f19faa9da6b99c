//! Safe one-shot global initialization.
//!
//! Kernel singletons (timer wheel, process table, VFS root) are created at
//! boot by an explicit `init(...)` and accessed afterwards through
//! [`GlobalState`]; there is no `static mut` in the kernel.

extern crate alloc;

use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that can be written to only once.
pub struct GlobalState<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GlobalState<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set()` via
            // Box::into_raw, so it refers to a valid leaked allocation. The
            // Acquire load synchronizes-with the Release store in `set()`,
            // so the pointee is fully initialized. The allocation is never
            // freed, giving it 'static lifetime.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell with a value.
    ///
    /// Returns `Err(value)` if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));

        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race: reclaim our allocation and hand the value
                // back to the caller.
                // SAFETY: `ptr` came from Box::into_raw above and was never
                // published, so we still own it.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get or initialize the value.
    pub fn get_or_init<F>(&self, f: F) -> &'static T
    where
        F: FnOnce() -> T,
    {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("GlobalState empty after set")
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_get() {
        let cell: GlobalState<u32> = GlobalState::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn second_set_returns_value() {
        let cell: GlobalState<u32> = GlobalState::new();
        cell.set(1).unwrap();
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn get_or_init_runs_closure_once() {
        let cell: GlobalState<u32> = GlobalState::new();
        assert_eq!(*cell.get_or_init(|| 5), 5);
        assert_eq!(*cell.get_or_init(|| 9), 5);
    }
}

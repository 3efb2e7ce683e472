//! The scheduler lock.
//!
//! On a single CPU, mutual exclusion against the only other mutator (the
//! timer interrupt) is interrupt masking. Until the scheduler has started
//! there is nothing to mask against, so the lock is free until then.
//!
//! The lock must not be nested: the guard re-enables interrupts when it
//! drops, so an inner guard would open the outer critical section early.
//! Every scheduler entry point takes it exactly once.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct SchedLock<T> {
    started: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SchedLock<T> {}
unsafe impl<T: Send> Sync for SchedLock<T> {}

pub struct SchedGuard<'a, T> {
    lock: &'a SchedLock<T>,
    masked: bool,
}

impl<T> SchedLock<T> {
    pub const fn new(data: T) -> SchedLock<T> {
        SchedLock {
            started: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Arm the lock; from here on it actually masks interrupts.
    pub fn set_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn lock(&self) -> SchedGuard<'_, T> {
        let masked = self.is_started();
        if masked {
            crate::arch::disable_interrupts();
        }
        SchedGuard { lock: self, masked }
    }

    /// Access without the guard, for the context-switch path, which must
    /// leave interrupts disabled after it returns.
    ///
    /// # Safety
    /// Caller must have interrupts disabled and must be the only accessor.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn force(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<T> Deref for SchedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SchedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SchedGuard<'_, T> {
    fn drop(&mut self) {
        if self.masked {
            crate::arch::enable_interrupts();
        }
    }
}

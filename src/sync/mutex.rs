//! Spin mutex with owner tracking.
//!
//! Acquisition attempts an atomic exchange on the lock word. On contention
//! the loser yields directly to the recorded owner when that owner is still
//! runnable, donating its timeslice so the holder can get to the unlock
//! sooner; otherwise it yields to whatever the scheduler picks. Before the
//! scheduler has started there is nothing to yield to, so contention spins
//! (and in practice never happens: boot is single-threaded).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

const UNLOCKED: u32 = 1;
const LOCKED: u32 = 0;
const NO_OWNER: i32 = -1;

pub struct KMutex<T: ?Sized> {
    word: AtomicU32,
    owner: AtomicI32,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for KMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for KMutex<T> {}

pub struct KMutexGuard<'a, T: ?Sized> {
    mutex: &'a KMutex<T>,
}

impl<T> KMutex<T> {
    pub const fn new(data: T) -> KMutex<T> {
        KMutex {
            word: AtomicU32::new(UNLOCKED),
            owner: AtomicI32::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> KMutex<T> {
    pub fn lock(&self) -> KMutexGuard<'_, T> {
        while self.word.swap(LOCKED, Ordering::Acquire) != UNLOCKED {
            if crate::scheduler::started() {
                let owner = self.owner.load(Ordering::Relaxed);
                crate::scheduler::thr::yield_to_owner(owner);
            } else {
                core::hint::spin_loop();
            }
        }
        // Record ourselves so contenders know whom to donate their slice to.
        self.owner
            .store(crate::scheduler::current_tid(), Ordering::Relaxed);
        KMutexGuard { mutex: self }
    }
}

impl<'a, T: ?Sized> KMutexGuard<'a, T> {
    /// Release the lock and hand back the mutex reference, so a condition
    /// variable can re-acquire it after sleeping.
    pub fn unlock(self) -> &'a KMutex<T> {
        let mutex = self.mutex;
        drop(self);
        mutex
    }
}

impl<T: ?Sized> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for KMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Clear the owner before opening the lock so a thread that sneaks in
        // between the two stores yields to the scheduler instead of us.
        self.mutex.owner.store(NO_OWNER, Ordering::Relaxed);
        self.mutex.word.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_round_trip() {
        let m = KMutex::new(7);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    fn unlock_returns_the_mutex() {
        let m = KMutex::new(());
        let g = m.lock();
        let back = g.unlock();
        // must be re-lockable immediately
        drop(back.lock());
    }
}

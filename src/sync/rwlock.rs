//! Reader/writer lock, writer-preferring.
//!
//! A writer request means the protected state is about to change, so late
//! readers wait behind it: readers block while a writer holds the lock, and
//! writers block while anyone holds it. Unlocking a writer broadcasts
//! (readers and writers may both be queued); a reader that drops the count
//! to zero signals a single waiter, which is necessarily a writer.

use super::{Condvar, KMutex};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

struct RwState {
    readers: i32,
    writer_held: bool,
}

pub struct RwLock<T: ?Sized> {
    state: KMutex<RwState>,
    cv: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

pub struct RwReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

pub struct RwWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub fn new(data: T) -> RwLock<T> {
        RwLock {
            state: KMutex::new(RwState {
                readers: 0,
                writer_held: false,
            }),
            cv: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writer_held {
            state = self.cv.wait(state);
        }
        state.readers += 1;
        RwReadGuard { lock: self }
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let mut state = self.state.lock();
        while state.writer_held || state.readers > 0 {
            state = self.cv.wait(state);
        }
        state.writer_held = true;
        RwWriteGuard { lock: self }
    }
}

impl<'a, T: ?Sized> RwWriteGuard<'a, T> {
    /// Atomically trade exclusive access for shared access, letting queued
    /// readers in without releasing the lock in between.
    pub fn downgrade(self) -> RwReadGuard<'a, T> {
        let lock = self.lock;
        {
            let mut state = lock.state.lock();
            state.writer_held = false;
            state.readers = 1;
            lock.cv.broadcast();
        }
        core::mem::forget(self);
        RwReadGuard { lock }
    }
}

impl<T: ?Sized> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            // anything still queued is a writer
            self.lock.cv.signal();
        }
    }
}

impl<T: ?Sized> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer_held = false;
        self.lock.cv.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_read_write() {
        let lock = RwLock::new(10);
        {
            let r = lock.read();
            assert_eq!(*r, 10);
        }
        {
            let mut w = lock.write();
            *w = 11;
        }
        assert_eq!(*lock.read(), 11);
    }

    #[test]
    fn downgrade_keeps_access() {
        let lock = RwLock::new(1);
        let mut w = lock.write();
        *w = 2;
        let r = w.downgrade();
        assert_eq!(*r, 2);
        drop(r);
        assert_eq!(*lock.write(), 2);
    }
}

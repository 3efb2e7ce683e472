//! In-kernel synchronization primitives.
//!
//! One canonical implementation of each primitive lives here; everything
//! above the scheduler (PCBs, the frame manager, the keyboard, the reaper)
//! is written against these.

pub mod cond;
pub mod mutex;
pub mod rwlock;
pub mod sched_lock;
pub mod sem;

pub use cond::Condvar;
pub use mutex::{KMutex, KMutexGuard};
pub use rwlock::RwLock;
pub use sched_lock::SchedLock;
pub use sem::Semaphore;

use core::sync::atomic::AtomicI32;

/// Record shared between a blocked thread and its waker.
///
/// The reject flag closes the race between "release the mutex" and "block":
/// a signaller sets it to 1 before making the thread runnable, and
/// `deschedule` refuses to block while it is nonzero. The flag is never
/// cleared by the sleeping side, so a spurious wakeup simply re-enters
/// `deschedule`.
pub struct Waiter {
    pub tid: i32,
    pub reject: AtomicI32,
}

impl Waiter {
    pub fn new(tid: i32) -> Waiter {
        Waiter {
            tid,
            reject: AtomicI32::new(0),
        }
    }
}

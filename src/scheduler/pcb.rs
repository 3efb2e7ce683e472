//! Process control blocks.
//!
//! A PCB owns its address space and the machinery `wait` rides on: a FIFO
//! of `(exit status, original tid)` records pushed by dying children, and a
//! counting semaphore whose value tracks the unclaimed records. Thread and
//! child counts are plain atomics; the internal mutex serializes signalling
//! against teardown.

use crate::errors::{KernError, KernResult};
use crate::memory::frame_manager::FrameManager;
use crate::memory::page_directory::PageDirectory;
use crate::memory::vmm;
use crate::scheduler::tcb::Tid;
use crate::sync::{KMutex, KMutexGuard, Semaphore};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

pub type Pid = i32;

/// One terminated child, waiting to be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub status: i32,
    pub original_tid: Tid,
}

pub struct Pcb {
    pid: AtomicI32,
    ppid: AtomicI32,
    original_tid: AtomicI32,
    num_threads: AtomicU32,
    num_children: AtomicU32,
    /// Serializes status signalling against PCB teardown.
    pub mutex: KMutex<()>,
    pd: KMutex<PageDirectory>,
    /// Cached so the context switch can reload CR3 without taking `pd`.
    pd_base: u32,
    status_queue: KMutex<VecDeque<StatusRecord>>,
    wait_sem: Semaphore,
}

impl Pcb {
    pub fn new() -> KernResult<Arc<Pcb>> {
        let pd = PageDirectory::new()?;
        let pd_base = pd.base_addr();
        Ok(Arc::new(Pcb {
            pid: AtomicI32::new(-1),
            ppid: AtomicI32::new(-1),
            original_tid: AtomicI32::new(-1),
            num_threads: AtomicU32::new(0),
            num_children: AtomicU32::new(0),
            mutex: KMutex::new(()),
            pd: KMutex::new(pd),
            pd_base,
            status_queue: KMutex::new(VecDeque::new()),
            wait_sem: Semaphore::new(0),
        }))
    }

    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn set_pid(&self, pid: Pid) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(Ordering::Relaxed)
    }

    pub fn set_ppid(&self, ppid: Pid) {
        self.ppid.store(ppid, Ordering::Relaxed);
    }

    pub fn original_tid(&self) -> Tid {
        self.original_tid.load(Ordering::Relaxed)
    }

    pub fn set_original_tid(&self, tid: Tid) {
        self.original_tid.store(tid, Ordering::Relaxed);
    }

    pub fn pd(&self) -> KMutexGuard<'_, PageDirectory> {
        self.pd.lock()
    }

    /// Physical address of the page directory, for CR3 reloads.
    pub fn pd_base(&self) -> u32 {
        self.pd_base
    }

    pub fn thread_count(&self) -> u32 {
        self.num_threads.load(Ordering::SeqCst)
    }

    pub fn inc_threads(&self) -> u32 {
        self.num_threads.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec_threads(&self) -> u32 {
        self.num_threads.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn child_count(&self) -> u32 {
        self.num_children.load(Ordering::SeqCst)
    }

    pub fn inc_children(&self) -> u32 {
        self.num_children.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Duplicate `source`'s address space into this PCB and record the
    /// parent link. `source` must be the current process.
    pub fn copy_from(&self, fm: &FrameManager, source: &Pcb) -> KernResult<()> {
        self.set_ppid(source.pid());
        let mut src_pd = source.pd.lock();
        let mut dst_pd = self.pd.lock();
        vmm::deep_copy(fm, &mut dst_pd, &mut src_pd)
    }

    /// Hand a terminated child's status to this process and wake one
    /// waiter.
    pub fn signal_status(&self, status: i32, original_tid: Tid) {
        self.status_queue.lock().push_back(StatusRecord {
            status,
            original_tid,
        });
        self.wait_sem.signal();
    }

    /// Collect one child status, blocking until one is available. Fails
    /// immediately when there is no child left to wait on; a successful
    /// collection consumes the child.
    pub fn wait_on_status(&self) -> KernResult<StatusRecord> {
        loop {
            let children = self.num_children.load(Ordering::SeqCst);
            if children == 0 {
                return Err(KernError::NotFound);
            }
            if self
                .num_children
                .compare_exchange(children, children - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        self.wait_sem.wait();

        let _guard = self.mutex.lock();
        self.status_queue
            .lock()
            .pop_front()
            .ok_or(KernError::Fatal)
    }

    /// Release the address space. Called by the reaper once the last thread
    /// is gone.
    pub fn teardown(&self, fm: &FrameManager) {
        let _guard = self.mutex.lock();
        let mut pd = self.pd.lock();
        vmm::clear_user_space(fm, &mut pd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_directory::init_kernel_template;

    fn pcb() -> Arc<Pcb> {
        init_kernel_template();
        Pcb::new().unwrap()
    }

    #[test]
    fn counters_track_threads_and_children() {
        let p = pcb();
        assert_eq!(p.thread_count(), 0);
        assert_eq!(p.inc_threads(), 1);
        assert_eq!(p.inc_threads(), 2);
        assert_eq!(p.dec_threads(), 1);
        assert_eq!(p.inc_children(), 1);
        assert_eq!(p.child_count(), 1);
    }

    #[test]
    fn wait_fails_with_no_children() {
        let p = pcb();
        assert_eq!(p.wait_on_status().unwrap_err(), KernError::NotFound);
    }

    #[test]
    fn signalled_status_is_collected_fifo() {
        let p = pcb();
        p.inc_children();
        p.inc_children();
        p.signal_status(42, 7);
        p.signal_status(43, 9);
        let first = p.wait_on_status().unwrap();
        assert_eq!(first, StatusRecord { status: 42, original_tid: 7 });
        let second = p.wait_on_status().unwrap();
        assert_eq!(second.status, 43);
        // both children consumed
        assert_eq!(p.wait_on_status().unwrap_err(), KernError::NotFound);
    }
}

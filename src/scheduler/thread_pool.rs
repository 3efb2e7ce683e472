//! The thread pool: four status lists plus the tid and pid indices.
//!
//! Every TCB lives in the tid index and appears in exactly the one list
//! matching its `status` field. The runnable list's head is the current (or
//! next) thread; rotation moves the head to the tail. The sleeping list is
//! kept sorted by ascending wake tick, ties in insertion order. All methods
//! here assume the caller holds the scheduler lock.

use crate::collections::sorted_insert_by_key;
use crate::errors::{KernError, KernResult};
use crate::scheduler::pcb::{Pcb, Pid};
use crate::scheduler::tcb::{Tcb, ThreadStatus, Tid};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

pub struct ThreadPool {
    tcbs: BTreeMap<Tid, Box<Tcb>>,
    pcbs: BTreeMap<Pid, Arc<Pcb>>,
    runnable: VecDeque<Tid>,
    waiting: VecDeque<Tid>,
    sleeping: VecDeque<Tid>,
    zombies: VecDeque<Tid>,
}

impl ThreadPool {
    pub fn new() -> ThreadPool {
        ThreadPool {
            tcbs: BTreeMap::new(),
            pcbs: BTreeMap::new(),
            runnable: VecDeque::new(),
            waiting: VecDeque::new(),
            sleeping: VecDeque::new(),
            zombies: VecDeque::new(),
        }
    }

    pub fn add_pcb(&mut self, pcb: Arc<Pcb>) {
        self.pcbs.insert(pcb.pid(), pcb);
    }

    pub fn remove_pcb(&mut self, pid: Pid) -> Option<Arc<Pcb>> {
        self.pcbs.remove(&pid)
    }

    pub fn find_pcb(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.pcbs.get(&pid).cloned()
    }

    /// Install a new TCB at the tail of the runnable list.
    pub fn add_runnable(&mut self, mut tcb: Box<Tcb>) {
        tcb.status = ThreadStatus::Runnable;
        let tid = tcb.tid;
        self.tcbs.insert(tid, tcb);
        self.runnable.push_back(tid);
    }

    pub fn find_tcb(&self, tid: Tid) -> Option<&Tcb> {
        self.tcbs.get(&tid).map(|b| b.as_ref())
    }

    pub fn find_tcb_mut(&mut self, tid: Tid) -> Option<&mut Tcb> {
        self.tcbs.get_mut(&tid).map(|b| b.as_mut())
    }

    /// Rotate the runnable list and report the new head, if any.
    pub fn next_runnable(&mut self) -> Option<Tid> {
        if self.runnable.len() > 1 {
            let head = self.runnable.pop_front().expect("nonempty deque");
            self.runnable.push_back(head);
        }
        self.runnable.front().copied()
    }

    fn unlink_runnable(&mut self, tid: Tid) -> KernResult<()> {
        let pos = self
            .runnable
            .iter()
            .position(|&t| t == tid)
            .ok_or(KernError::Fatal)?;
        self.runnable.remove(pos);
        Ok(())
    }

    fn unlink_waiting(&mut self, tid: Tid) -> KernResult<()> {
        let pos = self
            .waiting
            .iter()
            .position(|&t| t == tid)
            .ok_or(KernError::Fatal)?;
        self.waiting.remove(pos);
        Ok(())
    }

    fn unlink_sleeping(&mut self, tid: Tid) -> KernResult<()> {
        let pos = self
            .sleeping
            .iter()
            .position(|&t| t == tid)
            .ok_or(KernError::Fatal)?;
        self.sleeping.remove(pos);
        Ok(())
    }

    /// RUNNABLE/RUNNING → WAITING.
    pub fn make_waiting(&mut self, tid: Tid) -> KernResult<()> {
        let status = self.find_tcb(tid).ok_or(KernError::NotFound)?.status;
        if status == ThreadStatus::Waiting {
            return Err(KernError::AlreadyInState);
        }
        self.unlink_runnable(tid)?;
        self.waiting.push_back(tid);
        self.find_tcb_mut(tid).expect("indexed tcb").status = ThreadStatus::Waiting;
        Ok(())
    }

    /// WAITING/SLEEPING → RUNNABLE.
    pub fn make_runnable(&mut self, tid: Tid) -> KernResult<()> {
        let status = self.find_tcb(tid).ok_or(KernError::NotFound)?.status;
        match status {
            ThreadStatus::Runnable | ThreadStatus::Running => {
                return Err(KernError::AlreadyInState)
            }
            ThreadStatus::Waiting => self.unlink_waiting(tid)?,
            ThreadStatus::Sleeping => self.unlink_sleeping(tid)?,
            ThreadStatus::Zombie => return Err(KernError::NotFound),
        }
        self.runnable.push_back(tid);
        self.find_tcb_mut(tid).expect("indexed tcb").status = ThreadStatus::Runnable;
        Ok(())
    }

    /// RUNNING → SLEEPING until `wake_tick`. The sleeping list stays sorted
    /// by wake tick.
    pub fn make_sleeping(&mut self, tid: Tid, wake_tick: u32) -> KernResult<()> {
        let status = self.find_tcb(tid).ok_or(KernError::NotFound)?.status;
        if status == ThreadStatus::Sleeping {
            return Err(KernError::AlreadyInState);
        }
        self.unlink_runnable(tid)?;
        {
            let tcb = self.find_tcb_mut(tid).expect("indexed tcb");
            tcb.status = ThreadStatus::Sleeping;
            tcb.wake_tick = wake_tick;
        }
        let tcbs = &self.tcbs;
        sorted_insert_by_key(&mut self.sleeping, tid, |&t| {
            tcbs.get(&t).expect("sleeping tid indexed").wake_tick
        });
        Ok(())
    }

    /// Anything but ZOMBIE → ZOMBIE. The caller signals the zombie
    /// semaphore after this succeeds.
    pub fn make_zombie(&mut self, tid: Tid) -> KernResult<()> {
        let status = self.find_tcb(tid).ok_or(KernError::NotFound)?.status;
        match status {
            ThreadStatus::Runnable | ThreadStatus::Running => self.unlink_runnable(tid)?,
            ThreadStatus::Waiting => self.unlink_waiting(tid)?,
            ThreadStatus::Sleeping => self.unlink_sleeping(tid)?,
            ThreadStatus::Zombie => return Err(KernError::AlreadyInState),
        }
        self.zombies.push_back(tid);
        self.find_tcb_mut(tid).expect("indexed tcb").status = ThreadStatus::Zombie;
        Ok(())
    }

    /// Move every sleeper whose wake tick equals `now` to the runnable
    /// list. The list is sorted, so the scan stops at the first mismatch.
    pub fn wakeup(&mut self, now: u32) {
        while let Some(&tid) = self.sleeping.front() {
            let wake = self
                .find_tcb(tid)
                .expect("sleeping tid indexed")
                .wake_tick;
            if wake == now {
                self.make_runnable(tid).expect("sleeper must be wakeable");
            } else {
                break;
            }
        }
    }

    /// Oldest zombie, if any.
    pub fn first_zombie(&self) -> Option<Tid> {
        self.zombies.front().copied()
    }

    /// Pull a TCB out of the pool entirely (index and status list), handing
    /// ownership to the caller so the actual teardown can happen outside
    /// the scheduler lock.
    pub fn remove_tcb(&mut self, tid: Tid) -> Option<Box<Tcb>> {
        let status = self.find_tcb(tid)?.status;
        let unlinked = match status {
            ThreadStatus::Runnable | ThreadStatus::Running => self.unlink_runnable(tid),
            ThreadStatus::Waiting => self.unlink_waiting(tid),
            ThreadStatus::Sleeping => self.unlink_sleeping(tid),
            ThreadStatus::Zombie => {
                let pos = self.zombies.iter().position(|&t| t == tid)?;
                self.zombies.remove(pos);
                Ok(())
            }
        };
        unlinked.ok()?;
        self.tcbs.remove(&tid)
    }

    pub fn runnable_len(&self) -> usize {
        self.runnable.len()
    }

    /// Threads belonging to `pcb`, by identity.
    pub fn threads_of(&self, pcb: &Arc<Pcb>) -> usize {
        self.tcbs
            .values()
            .filter(|t| Arc::ptr_eq(&t.pcb, pcb))
            .count()
    }

    #[cfg(test)]
    fn list_of(&self, status: ThreadStatus) -> &VecDeque<Tid> {
        match status {
            ThreadStatus::Runnable | ThreadStatus::Running => &self.runnable,
            ThreadStatus::Waiting => &self.waiting,
            ThreadStatus::Sleeping => &self.sleeping,
            ThreadStatus::Zombie => &self.zombies,
        }
    }

    /// Test hook: every TCB is in exactly the list its status names.
    #[cfg(test)]
    pub fn check_consistency(&self) {
        let mut seen = 0;
        for (&tid, tcb) in &self.tcbs {
            assert_eq!(tcb.tid, tid);
            let list = self.list_of(tcb.status);
            assert_eq!(
                list.iter().filter(|&&t| t == tid).count(),
                1,
                "tid {} not in exactly one spot of its status list",
                tid
            );
            seen += 1;
        }
        assert_eq!(
            seen,
            self.runnable.len() + self.waiting.len() + self.sleeping.len() + self.zombies.len()
        );
        // sleeping list monotone in wake tick
        let wakes: alloc::vec::Vec<u32> = self
            .sleeping
            .iter()
            .map(|&t| self.find_tcb(t).unwrap().wake_tick)
            .collect();
        assert!(wakes.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_directory::init_kernel_template;
    use crate::scheduler::tcb::KERNEL_STACK_PAGES;

    fn pool_with(n: usize) -> (ThreadPool, Arc<Pcb>) {
        init_kernel_template();
        let mut pool = ThreadPool::new();
        let pcb = Pcb::new().unwrap();
        pcb.set_pid(1);
        pool.add_pcb(pcb.clone());
        for tid in 0..n as Tid {
            let tcb = Tcb::new(tid, pcb.clone(), None, KERNEL_STACK_PAGES).unwrap();
            pool.add_runnable(Box::new(tcb));
            pcb.inc_threads();
        }
        (pool, pcb)
    }

    #[test]
    fn rotation_cycles_head_to_tail() {
        let (mut pool, _) = pool_with(3);
        assert_eq!(pool.next_runnable(), Some(1));
        assert_eq!(pool.next_runnable(), Some(2));
        assert_eq!(pool.next_runnable(), Some(0));
        pool.check_consistency();
    }

    #[test]
    fn status_matches_list_membership() {
        let (mut pool, _) = pool_with(4);
        pool.make_waiting(1).unwrap();
        pool.make_sleeping(2, 50).unwrap();
        pool.make_zombie(3).unwrap();
        assert_eq!(pool.find_tcb(1).unwrap().status, ThreadStatus::Waiting);
        assert_eq!(pool.find_tcb(2).unwrap().status, ThreadStatus::Sleeping);
        assert_eq!(pool.find_tcb(3).unwrap().status, ThreadStatus::Zombie);
        pool.check_consistency();
        pool.make_runnable(1).unwrap();
        pool.make_runnable(2).unwrap();
        pool.check_consistency();
    }

    #[test]
    fn transition_guards_hold() {
        let (mut pool, _) = pool_with(2);
        pool.make_waiting(0).unwrap();
        assert_eq!(pool.make_waiting(0), Err(KernError::AlreadyInState));
        assert_eq!(pool.make_runnable(1), Err(KernError::AlreadyInState));
        assert_eq!(pool.make_waiting(99), Err(KernError::NotFound));
        pool.make_zombie(0).unwrap();
        assert_eq!(pool.make_zombie(0), Err(KernError::AlreadyInState));
        // a zombie cannot come back
        assert_eq!(pool.make_runnable(0), Err(KernError::NotFound));
    }

    #[test]
    fn sleeping_list_sorted_with_stable_ties() {
        let (mut pool, _) = pool_with(4);
        pool.make_sleeping(0, 100).unwrap();
        pool.make_sleeping(1, 5).unwrap();
        pool.make_sleeping(2, 50).unwrap();
        pool.make_sleeping(3, 50).unwrap();
        let order: alloc::vec::Vec<Tid> = pool.sleeping.iter().copied().collect();
        assert_eq!(order, [1, 2, 3, 0]);
        pool.check_consistency();
    }

    #[test]
    fn wakeup_moves_exact_tick_sleepers_in_order() {
        let (mut pool, _) = pool_with(4);
        pool.make_sleeping(1, 5).unwrap();
        pool.make_sleeping(2, 5).unwrap();
        pool.make_sleeping(3, 7).unwrap();
        pool.wakeup(4);
        assert_eq!(pool.find_tcb(1).unwrap().status, ThreadStatus::Sleeping);
        pool.wakeup(5);
        assert_eq!(pool.find_tcb(1).unwrap().status, ThreadStatus::Runnable);
        assert_eq!(pool.find_tcb(2).unwrap().status, ThreadStatus::Runnable);
        assert_eq!(pool.find_tcb(3).unwrap().status, ThreadStatus::Sleeping);
        // woken threads joined the runnable tail in wake order
        let tail: alloc::vec::Vec<Tid> =
            pool.runnable.iter().rev().take(2).copied().collect();
        assert_eq!(tail, [2, 1]);
        pool.check_consistency();
    }

    #[test]
    fn remove_tcb_clears_index_and_list() {
        let (mut pool, pcb) = pool_with(2);
        pool.make_zombie(0).unwrap();
        let tcb = pool.remove_tcb(0).unwrap();
        assert_eq!(tcb.tid, 0);
        assert!(pool.find_tcb(0).is_none());
        assert_eq!(pool.first_zombie(), None);
        assert_eq!(pool.threads_of(&pcb), 1);
        pool.check_consistency();
    }

    #[test]
    fn thread_count_matches_pool_census() {
        let (mut pool, pcb) = pool_with(3);
        assert_eq!(pool.threads_of(&pcb), pcb.thread_count() as usize);
        pool.make_zombie(1).unwrap();
        pool.remove_tcb(1).unwrap();
        pcb.dec_threads();
        assert_eq!(pool.threads_of(&pcb), pcb.thread_count() as usize);
    }
}

//! The scheduler.
//!
//! Round-robin over the runnable list, timer-driven wakeups for sleepers,
//! and the context-switch bookkeeping that trades saved kernel stack
//! pointers between threads. All pool state sits behind the scheduler lock;
//! the tick counter and the current tid are mirrored in atomics so hot
//! paths (mutex owner donation, `get_ticks`) never need it.

pub mod context;
pub mod pcb;
pub mod reaper;
pub mod tcb;
pub mod thr;
pub mod thread_pool;

use crate::arch;
use crate::errors::{KernError, KernResult};
use crate::memory::frame_manager::FrameManager;
use crate::scheduler::context::TrapFrame;
use crate::scheduler::pcb::{Pcb, Pid};
use crate::scheduler::tcb::{Tcb, ThreadStatus, Tid, KERNEL_STACK_PAGES};
use crate::scheduler::thread_pool::ThreadPool;
use crate::sync::{SchedLock, Semaphore};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// The reaper runs on a scheduler-allocated four-page stack.
const REAPER_STACK_PAGES: usize = 4;

pub struct SchedulerState {
    next_tid: Tid,
    next_pid: Pid,
    cur_tid: Option<Tid>,
    /// The idle thread lives outside the pool: it is never in any list and
    /// gets the CPU only when the runnable list is empty.
    idle: Option<Box<Tcb>>,
    idle_tid: Tid,
    init_pid: Pid,
    pool: ThreadPool,
}

pub struct Scheduler {
    state: SchedLock<SchedulerState>,
    ticks: AtomicU32,
    cur_tid_cache: AtomicI32,
    /// Signalled once per zombie insertion; the reaper waits on it.
    pub zombie_sem: Semaphore,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            state: SchedLock::new(SchedulerState {
                next_tid: 0,
                next_pid: 0,
                cur_tid: None,
                idle: None,
                idle_tid: -1,
                init_pid: -1,
                pool: ThreadPool::new(),
            }),
            ticks: AtomicU32::new(0),
            cur_tid_cache: AtomicI32::new(-1),
            zombie_sem: Semaphore::new(0),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.is_started()
    }

    pub fn get_ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Create the idle and reaper threads and load the init process. Runs
    /// once at boot with interrupts still off.
    pub fn bootstrap(&self, fm: &FrameManager) -> KernResult<()> {
        // idle: a kernel loop, deliberately outside the pool
        let idle_pcb = Pcb::new()?;
        let (idle_pid, idle_tid) = self.fresh_ids();
        idle_pcb.set_pid(idle_pid);
        idle_pcb.set_original_tid(idle_tid);
        let mut idle_tcb = Box::new(Tcb::new(idle_tid, idle_pcb, None, KERNEL_STACK_PAGES)?);
        idle_tcb.plant_kernel_frame(idle_loop as usize as u32);
        {
            let mut st = self.state.lock();
            st.idle_tid = idle_tid;
            st.idle = Some(idle_tcb);
        }

        // reaper: kernel-only, but a regular pool citizen
        let reaper_pcb = Pcb::new()?;
        let (reaper_pid, reaper_tid) = self.fresh_ids();
        reaper_pcb.set_pid(reaper_pid);
        reaper_pcb.set_original_tid(reaper_tid);
        reaper_pcb.inc_threads();
        let mut reaper_tcb = Box::new(Tcb::new(
            reaper_tid,
            reaper_pcb.clone(),
            None,
            REAPER_STACK_PAGES,
        )?);
        reaper_tcb.plant_kernel_frame(reaper::reap_loop as usize as u32);
        {
            let mut st = self.state.lock();
            st.pool.add_pcb(reaper_pcb);
            st.pool.add_runnable(reaper_tcb);
        }

        // init: the first user process, also the adopter of orphans
        let init_pcb = Pcb::new()?;
        arch::set_pdbr(init_pcb.pd_base());
        arch::enable_pge();
        arch::enable_paging();
        match crate::loader::load_into(fm, &init_pcb, "init", &[]) {
            Ok(frame) => {
                let tid = self.add_process(init_pcb.clone(), Some(frame))?;
                let mut st = self.state.lock();
                st.init_pid = init_pcb.pid();
                crate::log_info!("init loaded as pid {} (tid {})", init_pcb.pid(), tid);
            }
            Err(e) => {
                crate::log_error!("no init image: {}; idling", e);
            }
        }
        Ok(())
    }

    /// Enter the first thread. Interrupts come on with its `iretd`.
    pub fn start(&self) -> ! {
        self.state.set_started();
        arch::disable_interrupts();
        let st = unsafe { self.state.force() };
        let first = st.pool.next_runnable().unwrap_or(st.idle_tid);
        let esp = self.set_running(st, first);
        crate::log_info!("scheduler started, entering tid {}", first);
        unsafe { arch::switch::restore(esp as u32) }
    }

    fn fresh_ids(&self) -> (Pid, Tid) {
        let mut st = self.state.lock();
        let pid = st.next_pid;
        st.next_pid += 1;
        let tid = st.next_tid;
        st.next_tid += 1;
        (pid, tid)
    }

    fn fresh_tid(&self) -> Tid {
        let mut st = self.state.lock();
        let tid = st.next_tid;
        st.next_tid += 1;
        tid
    }

    /// Create a TCB running `pcb` and put it on the runnable tail. Used by
    /// fork, exec staging and kernel startup.
    pub fn add_process(&self, pcb: Arc<Pcb>, frame: Option<TrapFrame>) -> KernResult<Tid> {
        let (pid, tid) = self.fresh_ids();
        pcb.set_pid(pid);
        pcb.set_original_tid(tid);
        pcb.inc_threads();
        let tcb = Box::new(Tcb::new(tid, pcb.clone(), frame, KERNEL_STACK_PAGES)?);
        let mut st = self.state.lock();
        st.pool.add_pcb(pcb);
        st.pool.add_runnable(tcb);
        Ok(tid)
    }

    /// Create a second thread in the current process (thread_fork).
    pub fn add_thread(&self, frame: TrapFrame) -> KernResult<Tid> {
        let pcb = self.current_pcb().ok_or(KernError::NotFound)?;
        let tid = self.fresh_tid();
        pcb.inc_threads();
        let tcb = Box::new(Tcb::new(tid, pcb, Some(frame), KERNEL_STACK_PAGES)?);
        let mut st = self.state.lock();
        st.pool.add_runnable(tcb);
        Ok(tid)
    }

    pub fn current_pcb(&self) -> Option<Arc<Pcb>> {
        let st = self.state.lock();
        let cur = st.cur_tid?;
        if cur == st.idle_tid {
            return st.idle.as_ref().map(|t| t.pcb.clone());
        }
        st.pool.find_tcb(cur).map(|t| t.pcb.clone())
    }

    pub fn init_pcb(&self) -> Option<Arc<Pcb>> {
        let st = self.state.lock();
        let pid = st.init_pid;
        st.pool.find_pcb(pid)
    }

    pub fn find_pcb(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.state.lock().pool.find_pcb(pid)
    }

    pub fn is_runnable(&self, tid: Tid) -> bool {
        self.state
            .lock()
            .pool
            .find_tcb(tid)
            .map_or(false, |t| t.status == ThreadStatus::Runnable)
    }

    /// Store the exit status on the current thread.
    pub fn set_exit_status(&self, status: i32) {
        let mut st = self.state.lock();
        if let Some(cur) = st.cur_tid {
            if let Some(tcb) = st.pool.find_tcb_mut(cur) {
                tcb.exit_status = status;
            }
        }
    }

    /// Run `f` on the current TCB under the scheduler lock.
    pub fn with_current_tcb<R>(&self, f: impl FnOnce(&mut Tcb) -> R) -> Option<R> {
        let mut st = self.state.lock();
        let cur = st.cur_tid?;
        if cur == st.idle_tid {
            return st.idle.as_deref_mut().map(f);
        }
        st.pool.find_tcb_mut(cur).map(f)
    }

    fn tcb_mut<'a>(st: &'a mut SchedulerState, tid: Tid) -> Option<&'a mut Tcb> {
        if tid == st.idle_tid {
            st.idle.as_deref_mut()
        } else {
            st.pool.find_tcb_mut(tid)
        }
    }

    /// Record the outgoing thread's stack pointer and drop it back from
    /// RUNNING to RUNNABLE (unless a transition already moved it).
    fn defer_current(&self, st: &mut SchedulerState, old_esp: usize) {
        if let Some(cur) = st.cur_tid {
            if let Some(tcb) = Self::tcb_mut(st, cur) {
                tcb.saved_esp = old_esp;
                if tcb.status == ThreadStatus::Running {
                    tcb.status = ThreadStatus::Runnable;
                }
            }
        }
    }

    /// Make `tid` the running thread: install its kernel stack top for the
    /// next trap, reload the page-directory base, and hand back its saved
    /// stack pointer.
    fn set_running(&self, st: &mut SchedulerState, tid: Tid) -> usize {
        let tcb = Self::tcb_mut(st, tid).expect("scheduling a vanished tid");
        tcb.status = ThreadStatus::Running;
        let saved_esp = tcb.saved_esp;
        let stack_top = tcb.kernel_stack_top();
        let pd_base = tcb.pcb.pd_base();
        st.cur_tid = Some(tid);
        self.cur_tid_cache.store(tid, Ordering::Relaxed);
        arch::set_esp0(stack_top);
        arch::set_pdbr(pd_base);
        saved_esp
    }

    /// Atomically check a reject flag and move the current thread to
    /// WAITING when it is still clear. Returns true when the thread was
    /// descheduled and the caller must yield. The check and the transition
    /// share one scheduler-lock critical section, which is what makes a
    /// concurrent `set flag; make_runnable` sequence race-free.
    pub fn deschedule_if_unrejected(&self, reject: &core::sync::atomic::AtomicI32) -> bool {
        let mut st = self.state.lock();
        if reject.load(Ordering::SeqCst) != 0 {
            return false;
        }
        let Some(cur) = st.cur_tid else { return false };
        st.pool.make_waiting(cur).is_ok()
    }

    pub fn make_runnable(&self, tid: Tid) -> KernResult<()> {
        let mut st = self.state.lock();
        st.pool.make_runnable(tid)
    }

    /// Put the current thread to sleep until `ticks` ticks from now.
    pub fn make_current_sleeping(&self, ticks: i32) -> KernResult<()> {
        if ticks < 0 {
            return Err(KernError::BadPointer);
        }
        if ticks == 0 {
            return Ok(());
        }
        let now = self.get_ticks();
        let wake = now
            .checked_add(ticks as u32)
            .ok_or(KernError::Overflow)?;
        let mut st = self.state.lock();
        let cur = st.cur_tid.ok_or(KernError::NotFound)?;
        st.pool.make_sleeping(cur, wake)
    }

    /// The deschedule syscall's core: atomically read the user's reject
    /// word and move the current thread to WAITING when it is zero.
    /// Returns whether the thread was descheduled (caller must yield).
    /// The caller has validated that `reject_addr` is user-readable.
    pub fn deschedule_current_if_zero(&self, reject_addr: u32) -> KernResult<bool> {
        let mut st = self.state.lock();
        let value = unsafe { arch::read_u32(reject_addr) };
        if value != 0 {
            return Ok(false);
        }
        let cur = st.cur_tid.ok_or(KernError::NotFound)?;
        st.pool.make_waiting(cur)?;
        Ok(true)
    }

    /// Oldest zombie tid, if any.
    pub fn first_zombie(&self) -> Option<Tid> {
        self.state.lock().pool.first_zombie()
    }

    /// Pull `tid` (a zombie) out of the pool, along with its PCB when this
    /// was the process's last thread. `collect` runs under the scheduler
    /// lock and must only stash the ownership handles; the real teardown
    /// happens after the lock is gone.
    pub fn reap_zombie(&self, tid: Tid, collect: impl FnOnce(Box<Tcb>, Option<Arc<Pcb>>)) {
        let mut st = self.state.lock();
        let Some(tcb) = st.pool.remove_tcb(tid) else {
            return;
        };
        let pcb = if tcb.pcb.thread_count() == 0 {
            st.pool.remove_pcb(tcb.pcb.pid())
        } else {
            None
        };
        collect(tcb, pcb);
    }

    /// Retire the current thread to the zombie list. The caller signals the
    /// zombie semaphore *before* calling this (signalling afterwards could
    /// be cut off by a preemption this thread never comes back from) and
    /// must yield, never to return, once this succeeds.
    pub fn make_current_zombie(&self) -> KernResult<()> {
        let mut st = self.state.lock();
        let cur = st.cur_tid.take().ok_or(KernError::NotFound)?;
        st.pool.make_zombie(cur)?;
        self.cur_tid_cache.store(-1, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

/// Whether the scheduler is running (and locks should actually lock).
pub fn started() -> bool {
    crate::context::try_kernel().map_or(false, |k| k.sched.is_started())
}

/// Tid of the thread on the CPU; -1 before the first switch.
pub fn current_tid() -> Tid {
    crate::context::try_kernel().map_or(-1, |k| k.sched.cur_tid_cache.load(Ordering::Relaxed))
}

/// The context-switch core, called from the yield trampoline and the timer
/// path with the outgoing thread's saved stack pointer. Picks the incoming
/// thread (the caller's choice if that tid is still runnable, the rotation
/// otherwise, idle when nothing is runnable) and returns its saved stack
/// pointer. Interrupts are left disabled; the incoming thread's `iretd`
/// restores its own interrupt state.
pub extern "C" fn context_switch(old_esp: u32, target_tid: i32) -> u32 {
    arch::disable_interrupts();
    let k = crate::context::kernel();
    let st = unsafe { k.sched.state.force() };

    k.sched.defer_current(st, old_esp as usize);

    let next = if target_tid >= 0
        && st
            .pool
            .find_tcb(target_tid)
            .map_or(false, |t| t.status == ThreadStatus::Runnable)
    {
        target_tid
    } else {
        st.pool.next_runnable().unwrap_or(st.idle_tid)
    };

    k.sched.set_running(st, next) as u32
}

/// Timer interrupt entry (the trampoline saved a `TrapFrame` at `old_esp`).
/// Advances time, wakes due sleepers, and preempts.
pub extern "C" fn timer_tick(old_esp: u32) -> u32 {
    let Some(k) = crate::context::try_kernel() else {
        return old_esp;
    };
    let now = k.sched.ticks.fetch_add(1, Ordering::Relaxed) + 1;
    arch::pic::end_of_interrupt(arch::pic::InterruptIndex::Timer);
    if !k.sched.is_started() {
        return old_esp;
    }
    {
        let st = unsafe { k.sched.state.force() };
        st.pool.wakeup(now);
    }
    context_switch(old_esp, -1)
}

/// The idle thread: runs only when the runnable list is empty.
extern "C" fn idle_loop() -> ! {
    loop {
        arch::hlt();
    }
}

//! Thread manipulation entry points.
//!
//! Shared by the system-call adaptors and by kernel code (locks, the
//! reaper). Two suspension styles exist, and which one a path uses is
//! load-bearing:
//!
//! * trap-frame suspension (`switch_and_restore`): the thread resumes
//!   straight at its saved trap frame, abandoning the kernel call stack.
//!   Used by yield/sleep/deschedule/vanish, whose results are written into
//!   the frame before blocking.
//! * mid-kernel suspension (`arch::switch::kern_yield`): builds a resumable
//!   frame on the spot and returns normally once rescheduled. Used by
//!   everything that must continue kernel work after waking (semaphores,
//!   condition variables, mutex donation).

use crate::arch;
use crate::context::kernel;
use crate::errors::{KernError, KernResult};
use crate::scheduler::tcb::Tid;
use core::sync::atomic::AtomicI32;

/// Tid of the calling thread.
pub fn gettid() -> Tid {
    crate::scheduler::current_tid()
}

/// Suspend at `old_esp` (a saved trap frame) and never return here; the
/// thread continues at the frame when rescheduled.
pub fn switch_and_restore(old_esp: usize, target_tid: Tid) -> ! {
    let new_esp = crate::scheduler::context_switch(old_esp as u32, target_tid);
    unsafe { arch::switch::restore(new_esp) }
}

/// Yield the rest of this slice. With `tid >= 0`, fails without switching
/// unless that thread is runnable. Never returns on success.
pub fn yield_to(old_esp: usize, tid: Tid) -> KernResult<()> {
    if tid >= 0 && !kernel().sched.is_runnable(tid) {
        return Err(KernError::NotRunnable);
    }
    switch_and_restore(old_esp, tid)
}

/// Donate the remainder of this slice to a mutex owner, falling back to the
/// scheduler's pick when the owner is gone or not runnable.
pub fn yield_to_owner(owner: Tid) {
    if owner >= 0 && kernel().sched.is_runnable(owner) {
        arch::switch::kern_yield(owner);
    } else {
        arch::switch::kern_yield(-1);
    }
}

/// Kernel-side deschedule with a reject flag: blocks unless the flag is
/// already set. The check and the transition to WAITING happen under the
/// scheduler lock, so a signaller that sets the flag and then calls
/// `make_runnable` can never lose the wakeup.
pub fn kern_deschedule(reject: &AtomicI32) {
    if kernel().sched.deschedule_if_unrejected(reject) {
        arch::switch::kern_yield(-1);
    }
}

/// Move `tid` from WAITING (or SLEEPING) back to RUNNABLE.
pub fn make_runnable(tid: Tid) -> KernResult<()> {
    kernel().sched.make_runnable(tid)
}

/// Record `status` as the exit status of the calling thread.
pub fn set_status(status: i32) {
    kernel().sched.set_exit_status(status);
}

/// Put the calling thread to sleep for `ticks` timer ticks. Returns only
/// when `ticks` is zero or invalid; otherwise the thread resumes at its
/// trap frame after waking.
pub fn sleep(old_esp: usize, ticks: i32) -> KernResult<()> {
    if ticks < 0 {
        return Err(KernError::BadPointer);
    }
    if ticks == 0 {
        return Ok(());
    }
    kernel().sched.make_current_sleeping(ticks)?;
    switch_and_restore(old_esp, -1)
}

/// Terminate the calling thread; never returns.
///
/// If this was the last thread of its process, the exit status and the
/// process's original tid are queued on the parent (or on init when the
/// parent is already gone, with init adopting the orphan first). The TCB
/// goes to the zombie list for the reaper.
pub fn vanish(old_esp: usize) -> ! {
    let sched = &kernel().sched;

    let (pcb, exit_status) = {
        let mut info = None;
        sched.with_current_tcb(|tcb| {
            info = Some((tcb.pcb.clone(), tcb.exit_status));
        });
        info.expect("vanish with no current thread")
    };
    let original_tid = pcb.original_tid();

    match sched.find_pcb(pcb.ppid()) {
        Some(parent) => {
            // hold the parent's mutex so it cannot be torn down mid-signal
            let _guard = parent.mutex.lock();
            if pcb.dec_threads() == 0 {
                parent.signal_status(exit_status, original_tid);
            }
        }
        None => {
            // orphan: init adopts the process and collects its status
            let init = sched.init_pcb();
            if let Some(init) = init {
                init.inc_children();
                if pcb.dec_threads() == 0 {
                    init.signal_status(exit_status, original_tid);
                }
            } else {
                pcb.dec_threads();
            }
        }
    }

    crate::println!("Thread {} exited with status {}", gettid(), exit_status);

    // The signal comes first: once this thread is a zombie a preemption can
    // take the CPU away for good, so nothing after the transition is
    // guaranteed to run. The reaper tolerates seeing the signal early.
    sched.zombie_sem.signal();
    sched
        .make_current_zombie()
        .expect("current thread must be zombifiable");
    switch_and_restore(old_esp, -1)
}

/// Collect one dead child of the calling process. Blocks until a child
/// vanishes; fails if there is nothing left to wait for.
pub fn wait() -> KernResult<crate::scheduler::pcb::StatusRecord> {
    let pcb = kernel().sched.current_pcb().ok_or(KernError::NotFound)?;
    pcb.wait_on_status()
}

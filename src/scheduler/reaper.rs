//! The reaper: a kernel-only thread that frees zombie resources.
//!
//! Vanishing threads cannot free their own kernel stack (they are standing
//! on it), so they park in the zombie list and bump the zombie semaphore.
//! The reaper blocks on that semaphore, pulls the oldest zombie out of the
//! pool under the scheduler lock, and does the actual teardown afterwards:
//! freeing memory can take the heap lock and the frame-manager mutex, and
//! neither belongs inside an interrupts-off section. Ownership taken out of
//! the pool is parked in a small ring buffer until the lock is released.

use crate::collections::RingBuffer;
use crate::context::kernel;
use crate::scheduler::pcb::Pcb;
use crate::scheduler::tcb::Tcb;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Upper bound on ownership handles a single reap can accumulate.
const DEFERRED_SLOTS: usize = 32;

enum Deferred {
    Thread(Box<Tcb>),
    Process(Arc<Pcb>),
}

pub extern "C" fn reap_loop() -> ! {
    let k = kernel();
    let mut deferred: RingBuffer<Deferred> = RingBuffer::new(DEFERRED_SLOTS);

    loop {
        // Wait for a zombie to exist.
        k.sched.zombie_sem.wait();

        // A vanishing thread signals just before it parks itself in the
        // zombie list, so the signal can arrive a moment early. The
        // signaller is runnable and about to finish; spin-yield until its
        // zombie shows up.
        let tid = loop {
            if let Some(tid) = k.sched.first_zombie() {
                break tid;
            }
            crate::arch::switch::kern_yield(-1);
        };

        k.sched.reap_zombie(tid, |tcb, pcb| {
            if deferred.write(Deferred::Thread(tcb)).is_err() {
                // Ring full; freeing under the lock is the lesser evil.
            }
            if let Some(pcb) = pcb {
                let _ = deferred.write(Deferred::Process(pcb));
            }
        });

        // The scheduler lock is released; destroy what we collected.
        while let Some(item) = deferred.read() {
            match item {
                Deferred::Thread(tcb) => drop(tcb),
                Deferred::Process(pcb) => {
                    pcb.teardown(&k.fm);
                    drop(pcb);
                }
            }
        }
    }
}

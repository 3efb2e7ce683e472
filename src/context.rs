//! The kernel's root object.
//!
//! Every process-wide singleton hangs off one `KernelContext`, built once
//! during boot. Subsystems receive it (or the pieces they need) explicitly;
//! the only other module-level mutable state in the kernel is the kernel
//! page-directory template, which is written once and read-only after.

use crate::drivers::keyboard::Keyboard;
use crate::memory::frame_manager::FrameManager;
use crate::scheduler::Scheduler;
use crate::sync::KMutex;
use spin::Once;

pub struct KernelContext {
    pub fm: FrameManager,
    pub sched: Scheduler,
    pub keyboard: Keyboard,
    /// Serializes console output from the `print` syscall.
    pub console_lock: KMutex<()>,
}

static KERNEL: Once<KernelContext> = Once::new();

/// Build the context. `machine_end` bounds the physical memory handed to
/// the frame manager.
pub fn init(machine_end: u32) {
    KERNEL.call_once(|| KernelContext {
        fm: FrameManager::new(machine_end),
        sched: Scheduler::new(),
        keyboard: Keyboard::new(),
        console_lock: KMutex::new(()),
    });
}

/// The context. Panics before `init`.
pub fn kernel() -> &'static KernelContext {
    KERNEL.get().expect("kernel context used before init")
}

/// The context, or `None` during early boot. Lock paths use this so they
/// stay usable before the context exists.
pub fn try_kernel() -> Option<&'static KernelContext> {
    KERNEL.get()
}

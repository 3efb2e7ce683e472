//! The assembly half of the context switch.
//!
//! Both routines here agree with [`crate::scheduler::context::TrapFrame`] on
//! the exact stack layout: segment registers lowest, then the `pushad`
//! block, then the `iretd` frame (plus user `esp`/`ss` when the thread was
//! suspended out of ring 3). The scheduler only ever sees opaque stack
//! pointers; this file is the one place that knows what they point at.

#[cfg(target_arch = "x86")]
mod imp {
    use core::arch::naked_asm;

    /// Suspend the calling kernel thread and hand the CPU to `target_tid`
    /// (`-1` lets the scheduler pick). Returns 0 once this thread is
    /// scheduled again.
    ///
    /// Builds a resumable [`TrapFrame`] on the current kernel stack with
    /// `eip` pointing at the local resume label, then trades stack pointers
    /// through the scheduler.
    #[unsafe(naked)]
    pub extern "C" fn kern_yield(target_tid: i32) -> i32 {
        naked_asm!(
            // iretd frame: eflags, cs, eip (the resume label, materialized
            // position-independently)
            "pushfd",
            "push cs",
            "call 3f",
            "3:",
            "pop eax",
            "add eax, 2f - 3b",
            "push eax",
            // general registers, then segments, matching TrapFrame
            "pushad",
            "push ds",
            "push es",
            "push fs",
            "push gs",
            // context_switch(old_esp, target_tid); the argument sits above
            // the 60-byte frame plus the return address
            "mov eax, esp",
            "mov ecx, [esp + 64]",
            "push ecx",
            "push eax",
            "call {context_switch}",
            // eax = incoming thread's saved stack pointer; interrupts stay
            // off until its iretd restores EFLAGS
            "mov esp, eax",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "iretd",
            // resumption lands here on our own stack
            "2:",
            "xor eax, eax",
            "ret",
            context_switch = sym crate::scheduler::context_switch,
        );
    }

    /// Adopt a previously saved kernel stack and never come back. Used when
    /// the current thread has no frame worth saving (vanish) and for the
    /// very first entry into user space.
    ///
    /// # Safety
    /// `esp` must point at a well-formed [`TrapFrame`].
    #[unsafe(naked)]
    pub unsafe extern "C" fn restore(esp: u32) -> ! {
        naked_asm!(
            "mov esp, [esp + 4]",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "iretd",
        );
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    pub extern "C" fn kern_yield(_target_tid: i32) -> i32 {
        unreachable!("context switch on host");
    }

    pub unsafe extern "C" fn restore(_esp: u32) -> ! {
        unreachable!("context switch on host");
    }
}

pub use imp::*;

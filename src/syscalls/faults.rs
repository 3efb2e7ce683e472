//! Processor exception entry points.
//!
//! The boot-time IDT installer wires these behind the same save-a-frame
//! trampolines the syscalls use. A fault out of user mode is either handed
//! to the thread's software-exception handler or kills the process with a
//! nonzero status; a fault inside the kernel is an invariant violation and
//! halts with a diagnostic.

use crate::arch;
use crate::scheduler::context::TrapFrame;

/// Exception vector numbers the kernel distinguishes.
pub mod cause {
    pub const DIVIDE: u32 = 0;
    pub const DEBUG: u32 = 1;
    pub const BREAKPOINT: u32 = 3;
    pub const OVERFLOW: u32 = 4;
    pub const BOUND: u32 = 5;
    pub const INVALID_OPCODE: u32 = 6;
    pub const GENERAL_PROTECTION: u32 = 13;
    pub const PAGE_FAULT: u32 = 14;
    pub const ALIGNMENT: u32 = 17;
}

fn from_user(frame: &TrapFrame) -> bool {
    frame.cs & 3 == 3
}

/// Page-fault entry. The faulting address sits in CR2.
pub extern "C" fn page_fault(frame: &mut TrapFrame, error_code: u32) {
    let cr2 = arch::get_cr2();
    if !from_user(frame) {
        panic!(
            "kernel page fault: address {:#x}, error {:#x}, eip {:#x}",
            cr2, error_code, frame.eip
        );
    }
    super::swexn::deliver_or_kill(frame, cause::PAGE_FAULT, cr2, error_code);
}

/// Entry for every other exception vector.
pub extern "C" fn exception(frame: &mut TrapFrame, vector: u32, error_code: u32) {
    if !from_user(frame) {
        panic!(
            "kernel exception {}: error {:#x}, eip {:#x}",
            vector, error_code, frame.eip
        );
    }
    super::swexn::deliver_or_kill(frame, vector, 0, error_code);
}

/// Keyboard IRQ entry: the external scancode decoder has already turned the
/// scancode into a character. EOI comes first: pushing the character can
/// contend on the keyboard mutex and yield away from this handler.
pub extern "C" fn keyboard_char(c: u8) {
    arch::pic::end_of_interrupt(arch::pic::InterruptIndex::Keyboard);
    crate::context::kernel().keyboard.receive_char(c);
}

//! The software-exception handler syscall and delivery path.
//!
//! A thread may install one user-space handler `(stack top, entry, arg)`.
//! When a user-mode fault arrives, the kernel deregisters the handler,
//! builds a `UReg` snapshot on the handler stack, and redirects the thread
//! there; the handler may reinstall itself and hand back a `UReg` to resume
//! from. Every field of a user-supplied `UReg` is checked before the kernel
//! agrees to adopt it.

use crate::arch::{self, eflags, seg};
use crate::context::kernel;
use crate::errors::KernError;
use crate::memory::USER_MEM_START;
use crate::scheduler::context::TrapFrame;
use crate::scheduler::tcb::SwexnHandler;
use crate::scheduler::thr;

/// Register snapshot handed to (and accepted back from) a user handler.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UReg {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl UReg {
    pub fn from_frame(frame: &TrapFrame, cause: u32, cr2: u32, error_code: u32) -> UReg {
        UReg {
            cause,
            cr2,
            ds: frame.ds,
            es: frame.es,
            fs: frame.fs,
            gs: frame.gs,
            edi: frame.edi,
            esi: frame.esi,
            ebp: frame.ebp,
            zero: 0,
            ebx: frame.ebx,
            edx: frame.edx,
            ecx: frame.ecx,
            eax: frame.eax,
            error_code,
            eip: frame.eip,
            cs: frame.cs,
            eflags: frame.eflags,
            esp: frame.esp,
            ss: frame.ss,
        }
    }

    pub fn to_frame(&self) -> TrapFrame {
        TrapFrame {
            gs: self.gs,
            fs: self.fs,
            es: self.es,
            ds: self.ds,
            edi: self.edi,
            esi: self.esi,
            ebp: self.ebp,
            esp_dummy: 0,
            ebx: self.ebx,
            edx: self.edx,
            ecx: self.ecx,
            eax: self.eax,
            eip: self.eip,
            cs: self.cs,
            eflags: self.eflags,
            esp: self.esp,
            ss: self.ss,
        }
    }
}

fn esp_safe(esp: u32) -> bool {
    esp >= USER_MEM_START
}

fn eip_safe(eip: u32) -> bool {
    eip >= USER_MEM_START
}

/// A user frame must stay in ring 3: reserved bit set, no high reserved
/// bits, interrupts on, IOPL zero.
fn eflags_safe(flags: u32) -> bool {
    flags & eflags::RESV1 != 0
        && flags & eflags::RESV_HIGH == 0
        && flags & eflags::IF != 0
        && flags & eflags::IOPL_MASK == 0
}

fn ureg_safe(ureg: &UReg) -> bool {
    ureg.ds == seg::USER_DS
        && ureg.es == seg::USER_DS
        && ureg.fs == seg::USER_DS
        && ureg.gs == seg::USER_DS
        && ureg.ss == seg::USER_DS
        && ureg.cs == seg::USER_CS
        && eip_safe(ureg.eip)
        && esp_safe(ureg.esp)
        && eflags_safe(ureg.eflags)
}

fn put_handler(handler: Option<SwexnHandler>) {
    kernel().sched.with_current_tcb(|tcb| tcb.swexn = handler);
}

/// swexn(esp3, eip, arg, ureg): install/remove a handler and/or adopt a
/// register set. Any validation failure undoes the deregistration and
/// returns a negative code without other effects.
pub fn sys_swexn(frame: &mut TrapFrame) -> i32 {
    let (esp3, eip, arg, ureg_addr) = (frame.ebx, frame.ecx, frame.edx, frame.esi);
    let sched = &kernel().sched;

    // deregister whatever was installed
    let old = sched.with_current_tcb(|tcb| tcb.swexn.take()).flatten();

    if esp3 != 0 && eip != 0 {
        if !esp_safe(esp3) || !eip_safe(eip) {
            put_handler(old);
            return KernError::BadPointer.errno();
        }
        put_handler(Some(SwexnHandler { esp3, eip, arg }));
    }

    if ureg_addr != 0 {
        let pcb = match sched.current_pcb() {
            Some(p) => p,
            None => return KernError::NotFound.errno(),
        };
        let mut bytes = [0u8; core::mem::size_of::<UReg>()];
        if super::copy_from_user(&pcb, ureg_addr, &mut bytes).is_err() {
            put_handler(old);
            return KernError::BadPointer.errno();
        }
        let ureg = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const UReg) };
        if !ureg_safe(&ureg) {
            put_handler(old);
            return KernError::BadPointer.errno();
        }
        *frame = ureg.to_frame();
        // the adopted frame carries its own eax; dispatch writes it back
        return frame.eax as i32;
    }

    0
}

/// Deliver a user-mode fault: run the installed handler on its alternate
/// stack, or kill the process with a nonzero status when there is none (or
/// its stack turns out to be bogus).
pub fn deliver_or_kill(frame: &mut TrapFrame, cause: u32, cr2: u32, error_code: u32) {
    let sched = &kernel().sched;
    let handler = sched.with_current_tcb(|tcb| tcb.swexn.take()).flatten();

    let Some(handler) = handler else {
        kill_current(frame, cause, cr2);
    };

    let ureg = UReg::from_frame(frame, cause, cr2, error_code);
    let ureg_size = core::mem::size_of::<UReg>() as u32;

    let stack_top = handler.esp3 & !3;
    if stack_top < USER_MEM_START + ureg_size + 12 {
        kill_current(frame, cause, cr2);
    }
    let ureg_addr = stack_top - ureg_size;
    let sp = ureg_addr - 12; // ureg ptr, arg, fake return address

    let pcb = match sched.current_pcb() {
        Some(p) => p,
        None => kill_current(frame, cause, cr2),
    };
    if super::validate_user_buffer(&pcb, sp, (ureg_size + 12) as usize, true).is_err() {
        kill_current(frame, cause, cr2);
    }

    unsafe {
        let ureg_bytes = core::slice::from_raw_parts(
            &ureg as *const UReg as *const u8,
            ureg_size as usize,
        );
        arch::write_bytes(ureg_addr, ureg_bytes);
        arch::write_u32(sp + 8, ureg_addr);
        arch::write_u32(sp + 4, handler.arg);
        arch::write_u32(sp, 0);
    }

    frame.gs = seg::USER_DS;
    frame.fs = seg::USER_DS;
    frame.es = seg::USER_DS;
    frame.ds = seg::USER_DS;
    frame.cs = seg::USER_CS;
    frame.ss = seg::USER_DS;
    frame.eflags = arch::initial_eflags();
    frame.eip = handler.eip;
    frame.esp = sp;
}

fn kill_current(frame: &mut TrapFrame, cause: u32, cr2: u32) -> ! {
    crate::log_warn!(
        "killing tid {}: unhandled exception {} (cr2 {:#x}, eip {:#x})",
        thr::gettid(),
        cause,
        cr2,
        frame.eip
    );
    thr::set_status(-2);
    thr::vanish(frame as *mut TrapFrame as usize)
}

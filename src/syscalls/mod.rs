//! System-call dispatch.
//!
//! Each trap vector is a thin adaptor: validate the arguments against the
//! current page directory, then call into the scheduler, the VMM, the
//! keyboard or the loader. Pointer arguments that fail validation produce a
//! negative error code with no side effects.
//!
//! Trampoline contract: the (external) `int 0x80` trampoline saves a
//! `TrapFrame`, calls [`dispatch`] with a mutable reference to it, and
//! restores the frame afterwards. The result is written into the frame's
//! `eax` slot, not returned: a blocking call may never come back here, in
//! which case the thread resumes straight at the saved frame with `eax`
//! already holding the result.
//!
//! Register convention: `eax` = call number, arguments in `ebx`, `ecx`,
//! `edx`, `esi`.

pub mod faults;
pub mod swexn;

use crate::arch;
use crate::context::kernel;
use crate::errors::{KernError, KernResult};
use crate::memory::{page_align_down, PAGE_SIZE, USER_MEM_START};
use crate::scheduler::context::TrapFrame;
use crate::scheduler::pcb::Pcb;
use crate::scheduler::thr;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

pub const SYS_GETTID: u32 = 0x40;
pub const SYS_YIELD: u32 = 0x41;
pub const SYS_DESCHEDULE: u32 = 0x42;
pub const SYS_MAKE_RUNNABLE: u32 = 0x43;
pub const SYS_GET_TICKS: u32 = 0x44;
pub const SYS_SLEEP: u32 = 0x45;
pub const SYS_FORK: u32 = 0x46;
pub const SYS_EXEC: u32 = 0x47;
pub const SYS_SET_STATUS: u32 = 0x48;
pub const SYS_VANISH: u32 = 0x49;
pub const SYS_WAIT: u32 = 0x4A;
pub const SYS_THREAD_FORK: u32 = 0x4B;
pub const SYS_NEW_PAGES: u32 = 0x4C;
pub const SYS_REMOVE_PAGES: u32 = 0x4D;
pub const SYS_READLINE: u32 = 0x4E;
pub const SYS_PRINT: u32 = 0x4F;
pub const SYS_SET_TERM_COLOR: u32 = 0x50;
pub const SYS_SET_CURSOR_POS: u32 = 0x51;
pub const SYS_GET_CURSOR_POS: u32 = 0x52;
pub const SYS_READFILE: u32 = 0x53;
pub const SYS_HALT: u32 = 0x54;
pub const SYS_SWEXN: u32 = 0x55;
pub const SYS_MISBEHAVE: u32 = 0x56;

const MAX_PRINT_LEN: usize = 512;
const MAX_STRING_LEN: usize = 1024;
const MAX_ARGS: usize = 32;

fn frame_esp(frame: &mut TrapFrame) -> usize {
    frame as *mut TrapFrame as usize
}

fn as_result(r: KernResult<()>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}

/// Central syscall dispatcher, called from the trap trampolines.
pub extern "C" fn dispatch(frame: &mut TrapFrame) {
    // Trap gates enter with IF clear; long syscalls must stay preemptible.
    arch::enable_interrupts();

    let vector = frame.eax;
    let result: i32 = match vector {
        SYS_GETTID => thr::gettid(),
        SYS_YIELD => {
            let tid = frame.ebx as i32;
            frame.eax = 0;
            match thr::yield_to(frame_esp(frame), tid) {
                Ok(()) => 0,
                Err(e) => e.errno(),
            }
        }
        SYS_DESCHEDULE => {
            frame.eax = 0;
            match sys_deschedule(frame) {
                Ok(()) => 0,
                Err(e) => e.errno(),
            }
        }
        SYS_MAKE_RUNNABLE => as_result(thr::make_runnable(frame.ebx as i32)),
        SYS_GET_TICKS => kernel().sched.get_ticks() as i32,
        SYS_SLEEP => {
            let ticks = frame.ebx as i32;
            frame.eax = 0;
            match thr::sleep(frame_esp(frame), ticks) {
                Ok(()) => 0,
                Err(e) => e.errno(),
            }
        }
        SYS_FORK => sys_fork(frame),
        SYS_EXEC => match sys_exec(frame) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        },
        SYS_SET_STATUS => {
            thr::set_status(frame.ebx as i32);
            0
        }
        SYS_VANISH => thr::vanish(frame_esp(frame)),
        SYS_WAIT => match sys_wait(frame.ebx) {
            Ok(tid) => tid,
            Err(e) => e.errno(),
        },
        SYS_THREAD_FORK => match kernel().sched.add_thread(TrapFrame::forked(frame)) {
            Ok(tid) => tid,
            Err(e) => e.errno(),
        },
        SYS_NEW_PAGES => as_result(sys_new_pages(frame.ebx, frame.ecx)),
        SYS_REMOVE_PAGES => as_result(sys_remove_pages(frame.ebx)),
        SYS_READLINE => match sys_readline(frame.ebx as i32, frame.ecx) {
            Ok(n) => n as i32,
            Err(e) => e.errno(),
        },
        SYS_PRINT => as_result(sys_print(frame.ebx as i32, frame.ecx)),
        SYS_SET_TERM_COLOR => {
            let color = frame.ebx as u8;
            let _guard = kernel().console_lock.lock();
            crate::console::WRITER
                .lock()
                .set_color(crate::console::ColorCode::from_raw(color));
            0
        }
        SYS_SET_CURSOR_POS => {
            let _guard = kernel().console_lock.lock();
            match crate::console::WRITER
                .lock()
                .set_cursor(frame.ebx as usize, frame.ecx as usize)
            {
                Ok(()) => 0,
                Err(()) => KernError::BadPointer.errno(),
            }
        }
        SYS_GET_CURSOR_POS => as_result(sys_get_cursor_pos(frame.ebx, frame.ecx)),
        SYS_READFILE => {
            match sys_readfile(frame.ebx, frame.ecx, frame.edx as i32, frame.esi as i32) {
                Ok(n) => n as i32,
                Err(e) => e.errno(),
            }
        }
        SYS_HALT => {
            crate::log_info!("halt requested by tid {}", thr::gettid());
            arch::halt();
        }
        SYS_SWEXN => swexn::sys_swexn(frame),
        SYS_MISBEHAVE => 0,
        _ => {
            crate::log_warn!("unknown syscall vector {:#x}", vector);
            KernError::NotFound.errno()
        }
    };
    frame.eax = result as u32;
}

fn current_pcb() -> KernResult<Arc<Pcb>> {
    kernel().sched.current_pcb().ok_or(KernError::NotFound)
}

// ── user-pointer validation and copy helpers ──

/// Check that `[base, base + len)` is user-accessible (and user-writable
/// when `writable`) page by page in the current page directory.
fn validate_user_buffer(pcb: &Pcb, base: u32, len: usize, writable: bool) -> KernResult<()> {
    if len == 0 || base < USER_MEM_START {
        return Err(KernError::BadPointer);
    }
    let end = base
        .checked_add(len as u32 - 1)
        .ok_or(KernError::Overflow)?;
    let pd = pcb.pd();
    let mut page = page_align_down(base);
    loop {
        let ok = if writable {
            pd.is_user_writable(page)
        } else {
            pd.is_user_readable(page)
        };
        if !ok {
            return Err(KernError::BadPointer);
        }
        if page_align_down(end) == page {
            break;
        }
        page += PAGE_SIZE as u32;
    }
    Ok(())
}

fn copy_from_user(pcb: &Pcb, base: u32, buf: &mut [u8]) -> KernResult<()> {
    validate_user_buffer(pcb, base, buf.len(), false)?;
    unsafe { arch::read_bytes(base, buf) };
    Ok(())
}

fn copy_to_user(pcb: &Pcb, base: u32, data: &[u8]) -> KernResult<()> {
    validate_user_buffer(pcb, base, data.len(), true)?;
    unsafe { arch::write_bytes(base, data) };
    Ok(())
}

fn read_user_u32(pcb: &Pcb, addr: u32) -> KernResult<u32> {
    validate_user_buffer(pcb, addr, 4, false)?;
    Ok(unsafe { arch::read_u32(addr) })
}

fn write_user_u32(pcb: &Pcb, addr: u32, value: u32) -> KernResult<()> {
    validate_user_buffer(pcb, addr, 4, true)?;
    unsafe { arch::write_u32(addr, value) };
    Ok(())
}

/// Copy a NUL-terminated user string into the kernel, page-validated as it
/// goes, capped at `MAX_STRING_LEN` bytes.
fn read_user_string(pcb: &Pcb, mut addr: u32) -> KernResult<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let page_end = page_align_down(addr)
            .checked_add(PAGE_SIZE as u32)
            .ok_or(KernError::Overflow)?;
        let chunk_len = (page_end - addr) as usize;
        let mut chunk = vec![0u8; chunk_len];
        copy_from_user(pcb, addr, &mut chunk)?;
        for &b in &chunk {
            if b == 0 {
                return Ok(out);
            }
            if out.len() >= MAX_STRING_LEN {
                return Err(KernError::Overflow);
            }
            out.push(b);
        }
        addr = page_end;
    }
}

/// Walk a NULL-terminated user `argv` into kernel-owned strings.
fn read_user_argv(pcb: &Pcb, argv: u32) -> KernResult<Vec<Vec<u8>>> {
    let mut args = Vec::new();
    for i in 0..MAX_ARGS as u32 {
        let ptr = read_user_u32(pcb, argv + 4 * i)?;
        if ptr == 0 {
            return Ok(args);
        }
        args.push(read_user_string(pcb, ptr)?);
    }
    Err(KernError::Overflow)
}

// ── individual adaptors ──

fn sys_deschedule(frame: &mut TrapFrame) -> KernResult<()> {
    let reject_addr = frame.ebx;
    let pcb = current_pcb()?;
    validate_user_buffer(&pcb, reject_addr, 4, false)?;
    if kernel().sched.deschedule_current_if_zero(reject_addr)? {
        thr::switch_and_restore(frame_esp(frame), -1);
    }
    Ok(())
}

fn sys_fork(frame: &mut TrapFrame) -> i32 {
    let k = kernel();
    let parent = match current_pcb() {
        Ok(p) => p,
        Err(e) => return e.errno(),
    };

    let child = match Pcb::new() {
        Ok(c) => c,
        Err(e) => return e.errno(),
    };
    if let Err(e) = child.copy_from(&k.fm, &parent) {
        return e.errno();
    }

    match k.sched.add_process(child, Some(TrapFrame::forked(frame))) {
        Ok(tid) => {
            parent.inc_children();
            tid
        }
        Err(e) => e.errno(),
    }
}

fn sys_exec(frame: &mut TrapFrame) -> KernResult<()> {
    let pcb = current_pcb()?;
    if pcb.thread_count() > 1 {
        // exec in a multithreaded process would strand the siblings
        return Err(KernError::AlreadyInState);
    }
    let name_bytes = read_user_string(&pcb, frame.ebx)?;
    let name = core::str::from_utf8(&name_bytes).map_err(|_| KernError::BadPointer)?;
    let args = read_user_argv(&pcb, frame.ecx)?;

    let new_frame = crate::loader::exec_current(&kernel().fm, &pcb, name, &args)?;
    *frame = new_frame;
    Ok(())
}

fn sys_wait(status_addr: u32) -> KernResult<i32> {
    let pcb = current_pcb()?;
    if status_addr != 0 {
        validate_user_buffer(&pcb, status_addr, 4, true)?;
    }
    let record = thr::wait()?;
    if status_addr != 0 {
        write_user_u32(&pcb, status_addr, record.status as u32)?;
    }
    Ok(record.original_tid)
}

fn sys_new_pages(base: u32, len: u32) -> KernResult<()> {
    if len == 0 || len % PAGE_SIZE as u32 != 0 {
        return Err(KernError::BadPointer);
    }
    let pcb = current_pcb()?;
    let mut pd = pcb.pd();
    crate::memory::vmm::new_user_page(&kernel().fm, &mut pd, base, len / PAGE_SIZE as u32)
}

fn sys_remove_pages(base: u32) -> KernResult<()> {
    let pcb = current_pcb()?;
    let mut pd = pcb.pd();
    crate::memory::vmm::remove_user_page(&kernel().fm, &mut pd, base)
}

fn sys_readline(len: i32, buf: u32) -> KernResult<usize> {
    let k = kernel();
    if len <= 0 || len as usize > k.keyboard.capacity() {
        return Err(KernError::BadPointer);
    }
    let pcb = current_pcb()?;

    let mut line = vec![0u8; len as usize];
    let n = k.keyboard.read(&mut line)?;
    if n > 0 {
        // Validate after blocking: the mapping may have changed meanwhile.
        copy_to_user(&pcb, buf, &line[..n])?;
    }
    Ok(n)
}

fn sys_print(len: i32, buf: u32) -> KernResult<()> {
    if len <= 0 || len as usize > MAX_PRINT_LEN {
        return Err(KernError::BadPointer);
    }
    let pcb = current_pcb()?;
    let mut bytes = vec![0u8; len as usize];
    copy_from_user(&pcb, buf, &mut bytes)?;

    let _guard = kernel().console_lock.lock();
    crate::console::putbytes(&bytes);
    Ok(())
}

fn sys_get_cursor_pos(row_addr: u32, col_addr: u32) -> KernResult<()> {
    let pcb = current_pcb()?;
    validate_user_buffer(&pcb, row_addr, 4, true)?;
    validate_user_buffer(&pcb, col_addr, 4, true)?;
    let (row, col) = {
        let _guard = kernel().console_lock.lock();
        crate::console::WRITER.lock().cursor()
    };
    write_user_u32(&pcb, row_addr, row as u32)?;
    write_user_u32(&pcb, col_addr, col as u32)?;
    Ok(())
}

fn sys_readfile(name_addr: u32, buf: u32, count: i32, offset: i32) -> KernResult<usize> {
    if count < 0 || offset < 0 {
        return Err(KernError::BadPointer);
    }
    let pcb = current_pcb()?;
    let name_bytes = read_user_string(&pcb, name_addr)?;
    let name = core::str::from_utf8(&name_bytes).map_err(|_| KernError::BadPointer)?;

    if count > 0 {
        validate_user_buffer(&pcb, buf, count as usize, true)?;
    }
    let mut data = vec![0u8; count as usize];
    let n = crate::loader::getbytes(name, offset as usize, count as usize, &mut data)?;
    if n > 0 {
        copy_to_user(&pcb, buf, &data[..n])?;
    }
    Ok(n)
}

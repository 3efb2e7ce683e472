//! swexn exerciser: install a handler, fault on purpose, and resume at a
//! success function by handing the kernel a patched register set.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

#[repr(C, align(16))]
struct HandlerStack([u8; 4096]);

static mut HANDLER_STACK: HandlerStack = HandlerStack([0; 4096]);

/// Word index of `eip` in the kernel's ureg layout.
const UREG_EIP_INDEX: usize = 15;

extern "C" fn on_success() -> ! {
    marshlibc::print(b"swexn_test: ok\n");
    marshlibc::exit(0)
}

extern "C" fn handler(_arg: u32, ureg: *mut u32) {
    // redirect the faulting context to the success function and resume
    unsafe {
        *ureg.add(UREG_EIP_INDEX) = on_success as usize as u32;
    }
    marshlibc::swexn(0, 0, 0, ureg as u32);
    // the kernel refused the ureg; fail loudly
    marshlibc::print(b"swexn_test: resume rejected\n");
    marshlibc::exit(-1);
}

#[no_mangle]
pub extern "C" fn _start(_argc: i32, _argv: *const *const u8) -> ! {
    let stack_top = unsafe { (&raw const HANDLER_STACK as usize as u32) + 4096 };
    if marshlibc::swexn(stack_top, handler as usize as u32, 7, 0) < 0 {
        marshlibc::print(b"swexn_test: install failed\n");
        marshlibc::exit(-1);
    }

    // fault: read an address that is never mapped
    let _ = unsafe { core::ptr::read_volatile(0x10 as *const u32) };

    marshlibc::print(b"swexn_test: fault did not trap\n");
    marshlibc::exit(-1)
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    marshlibc::exit(-1)
}

//! fork/wait exerciser: the child exits 42, the parent collects exactly
//! that status once and must fail on the second wait.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

#[no_mangle]
pub extern "C" fn _start(_argc: i32, _argv: *const *const u8) -> ! {
    let child = marshlibc::fork();
    if child == 0 {
        marshlibc::exit(42);
    }
    if child < 0 {
        marshlibc::print(b"fork_wait: fork failed\n");
        marshlibc::exit(-1);
    }

    let mut status = 0;
    let reaped = marshlibc::wait(&mut status);
    if reaped != child || status != 42 {
        marshlibc::print(b"fork_wait: wrong child or status\n");
        marshlibc::exit(-1);
    }

    // no children left: this wait must fail
    if marshlibc::wait(&mut status) >= 0 {
        marshlibc::print(b"fork_wait: second wait succeeded\n");
        marshlibc::exit(-1);
    }

    marshlibc::print(b"fork_wait: ok\n");
    marshlibc::exit(0)
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    marshlibc::exit(-1)
}

//! Sleep-ordering exerciser: three children sleep 100, 5 and 50 ticks and
//! must be collected in the order 5, 50, 100 regardless of spawn order.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

const SLEEPS: [i32; 3] = [100, 5, 50];

#[no_mangle]
pub extern "C" fn _start(_argc: i32, _argv: *const *const u8) -> ! {
    for &ticks in SLEEPS.iter() {
        let child = marshlibc::fork();
        if child == 0 {
            marshlibc::sleep(ticks);
            marshlibc::exit(ticks);
        }
        if child < 0 {
            marshlibc::exit(-1);
        }
    }

    // children finish in ascending sleep order
    let mut expected = [5, 50, 100];
    for want in expected.iter_mut() {
        let mut status = 0;
        if marshlibc::wait(&mut status) < 0 || status != *want {
            marshlibc::print(b"sleep_order: wrong wake order\n");
            marshlibc::exit(-1);
        }
    }

    marshlibc::print(b"sleep_order: ok\n");
    marshlibc::exit(0)
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    marshlibc::exit(-1)
}

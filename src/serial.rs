use crate::arch;
use lazy_static::lazy_static;
use spin::Mutex;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const unsafe fn new(base: u16) -> SerialPort {
        SerialPort { base }
    }

    pub fn init(&mut self) {
        arch::outb(self.base + 1, 0x00);
        arch::outb(self.base + 3, 0x80);
        arch::outb(self.base, 0x03);
        arch::outb(self.base + 1, 0x00);
        arch::outb(self.base + 3, 0x03);
        arch::outb(self.base + 2, 0xC7);
        arch::outb(self.base + 4, 0x0B);
        arch::outb(self.base + 1, 0x01);
    }

    fn wait_for_tx_empty(&mut self) {
        while (arch::inb(self.base + 5) & 0x20) == 0 {}
    }

    pub fn send(&mut self, data: u8) {
        self.wait_for_tx_empty();
        arch::outb(self.base, data);
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL1.lock().write_fmt(args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[INFO] "));
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[WARN] "));
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[ERROR] "));
        $crate::serial::_print(format_args!($($arg)*));
        $crate::serial::_print(format_args!("\n"));
    };
}

pub fn init() {
    let _ = SERIAL1.lock();
}

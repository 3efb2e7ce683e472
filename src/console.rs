//! VGA text-mode console.
//!
//! The rest of the kernel talks to this through `print!`/`println!` and the
//! cursor/color accessors used by the console I/O system calls.

use crate::arch;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use volatile::Volatile;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const VGA_BUFFER_ADDR: usize = 0xb8000;

const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;
const CURSOR_HIGH: u8 = 0x0E;
const CURSOR_LOW: u8 = 0x0F;

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

/// Foreground/background pair packed the way the hardware wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ColorCode(u8);

impl ColorCode {
    pub const fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode((background as u8) << 4 | (foreground as u8))
    }

    pub fn from_raw(raw: u8) -> ColorCode {
        ColorCode(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    row: usize,
    column: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            b'\r' => self.column = 0,
            b'\x08' => self.backspace(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let color_code = self.color_code;
                self.buffer.chars[self.row][self.column].write(ScreenChar {
                    ascii_character: byte,
                    color_code,
                });
                self.column += 1;
                self.update_cursor();
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7e | b'\n' | b'\r' | b'\x08' => self.write_byte(byte),
                _ => self.write_byte(0xfe),
            }
        }
    }

    /// Erase the character before the cursor, wrapping to the previous row.
    pub fn backspace(&mut self) {
        if self.column == 0 {
            if self.row == 0 {
                return;
            }
            self.row -= 1;
            self.column = BUFFER_WIDTH - 1;
        } else {
            self.column -= 1;
        }
        let color_code = self.color_code;
        self.buffer.chars[self.row][self.column].write(ScreenChar {
            ascii_character: b' ',
            color_code,
        });
        self.update_cursor();
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
        } else {
            for row in 1..BUFFER_HEIGHT {
                for col in 0..BUFFER_WIDTH {
                    let character = self.buffer.chars[row][col].read();
                    self.buffer.chars[row - 1][col].write(character);
                }
            }
            self.clear_row(BUFFER_HEIGHT - 1);
        }
        self.update_cursor();
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.column = 0;
        self.update_cursor();
    }

    pub fn set_color(&mut self, color: ColorCode) {
        self.color_code = color;
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.column)
    }

    pub fn set_cursor(&mut self, row: usize, col: usize) -> Result<(), ()> {
        if row >= BUFFER_HEIGHT || col >= BUFFER_WIDTH {
            return Err(());
        }
        self.row = row;
        self.column = col;
        self.update_cursor();
        Ok(())
    }

    fn update_cursor(&self) {
        let pos = (self.row * BUFFER_WIDTH + self.column) as u16;
        arch::outb(CRTC_INDEX, CURSOR_HIGH);
        arch::outb(CRTC_DATA, (pos >> 8) as u8);
        arch::outb(CRTC_INDEX, CURSOR_LOW);
        arch::outb(CRTC_DATA, pos as u8);
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        row: 0,
        column: 0,
        color_code: ColorCode::new(Color::LightGray, Color::Black),
        buffer: unsafe { &mut *(VGA_BUFFER_ADDR as *mut Buffer) },
    });
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    WRITER.lock().write_fmt(args).unwrap();
}

/// Raw byte output used by the keyboard echo and the `print` syscall.
pub fn putbytes(bytes: &[u8]) {
    let mut writer = WRITER.lock();
    for &b in bytes {
        match b {
            0x20..=0x7e | b'\n' | b'\r' | b'\x08' => writer.write_byte(b),
            _ => writer.write_byte(0xfe),
        }
    }
}

pub fn putbyte(b: u8) {
    putbytes(core::slice::from_ref(&b));
}

/// Best-effort byte output for interrupt context: skips the character
/// rather than spinning on a writer the interrupted thread may hold.
pub fn try_putbyte(b: u8) {
    if let Some(mut writer) = WRITER.try_lock() {
        match b {
            0x20..=0x7e | b'\n' | b'\r' | b'\x08' => writer.write_byte(b),
            _ => writer.write_byte(0xfe),
        }
    }
}

pub fn init() {
    WRITER.lock().clear();
}

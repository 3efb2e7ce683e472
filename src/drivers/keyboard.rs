//! Line-buffered keyboard.
//!
//! The PS/2 scancode decoder (an external collaborator on the IRQ path)
//! feeds decoded characters into [`Keyboard::receive_char`]. Characters
//! accumulate in a bounded ring; each newline bumps the line semaphore,
//! whose value is therefore the number of unread lines. `read` blocks on
//! that semaphore and drains one line.
//!
//! Echo policy: characters (and backspace) appear on the console only while
//! at least one `readline` is pending, i.e. while the semaphore value is
//! negative. A backspace with nothing buffered is swallowed entirely.

use crate::sync::{KMutex, Semaphore};
use crate::collections::RingBuffer;
use crate::console;
use crate::errors::{KernError, KernResult};

/// Characters the keyboard can hold before keystrokes get dropped.
pub const KEYBOARD_BUFFER_SIZE: usize = 1024;

pub struct Keyboard {
    buf: KMutex<RingBuffer<u8>>,
    lines: Semaphore,
}

impl Keyboard {
    pub fn new() -> Keyboard {
        Keyboard {
            buf: KMutex::new(RingBuffer::new(KEYBOARD_BUFFER_SIZE)),
            lines: Semaphore::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        KEYBOARD_BUFFER_SIZE - 1
    }

    /// IRQ half: accept one decoded character.
    pub fn receive_char(&self, c: u8) {
        let mut buf = self.buf.lock();
        let read_pending = self.lines.value() < 0;

        let mut stored = false;
        match c {
            b'\x08' => {
                // honor the backspace only if there is something to erase
                if buf.delete_back() && read_pending {
                    console::try_putbyte(b'\x08');
                }
            }
            _ => {
                stored = buf.write(c).is_ok();
                if stored && read_pending {
                    console::try_putbyte(c);
                }
            }
        }

        // a newline dropped by a full ring is not a line
        if c == b'\n' && stored {
            drop(buf);
            self.lines.signal();
        }
    }

    /// Read one line (or `out.len()` characters, whichever is smaller) into
    /// `out`. Blocks until a full line is available. Returns the number of
    /// characters delivered, newline included when it fits.
    pub fn read(&self, out: &mut [u8]) -> KernResult<usize> {
        if out.is_empty() {
            return Err(KernError::BadPointer);
        }
        self.lines.wait();
        let mut buf = self.buf.lock();

        let mut n = 0;
        let mut saw_newline = false;
        while n < out.len() {
            match buf.read() {
                Some(c) => {
                    out[n] = c;
                    n += 1;
                    if c == b'\n' {
                        saw_newline = true;
                        break;
                    }
                }
                None => break,
            }
        }
        if n > 0 && !saw_newline {
            // the line's newline is still buffered; keep the semaphore
            // equal to the number of unread newlines
            drop(buf);
            self.lines.signal();
        }
        Ok(n)
    }
}

impl Default for Keyboard {
    fn default() -> Keyboard {
        Keyboard::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn type_line(kb: &Keyboard, s: &str) {
        for b in s.bytes() {
            kb.receive_char(b);
        }
    }

    #[test]
    fn one_line_in_one_line_out() {
        let kb = Keyboard::new();
        type_line(&kb, "hello\n");
        let mut out = [0u8; 16];
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello\n");
    }

    #[test]
    fn backspace_erases_unread_input() {
        let kb = Keyboard::new();
        type_line(&kb, "hexx");
        kb.receive_char(b'\x08');
        kb.receive_char(b'\x08');
        type_line(&kb, "llo\n");
        let mut out = [0u8; 16];
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"hello\n");
    }

    #[test]
    fn backspace_on_empty_buffer_is_swallowed() {
        let kb = Keyboard::new();
        kb.receive_char(b'\x08');
        type_line(&kb, "a\n");
        let mut out = [0u8; 4];
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"a\n");
    }

    #[test]
    fn short_reads_never_lose_or_duplicate_characters() {
        let kb = Keyboard::new();
        type_line(&kb, "abcdef\n");
        let mut out = [0u8; 3];
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"abc");
        // rest of the line still there, semaphore still shows one line
        assert_eq!(kb.lines.value(), 1);
        let mut rest = [0u8; 8];
        let n = kb.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"def\n");
        assert_eq!(kb.lines.value(), 0);
    }

    #[test]
    fn lines_queue_independently() {
        let kb = Keyboard::new();
        type_line(&kb, "one\n");
        type_line(&kb, "two\n");
        assert_eq!(kb.lines.value(), 2);
        let mut out = [0u8; 8];
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"one\n");
        let n = kb.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"two\n");
    }
}

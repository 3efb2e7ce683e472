use alloc::vec::Vec;

/// Fixed-capacity circular buffer with distinct read and write indices.
///
/// One slot is sacrificed to distinguish full from empty, so a buffer built
/// with capacity `n` holds `n - 1` elements. Writing into a full buffer and
/// reading from an empty one both fail rather than block; callers that need
/// blocking semantics layer a semaphore on top (see the keyboard driver).
pub struct RingBuffer<T> {
    buf: Vec<Option<T>>,
    read: usize,
    write: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        assert!(capacity >= 2, "ring buffer needs at least two slots");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);
        RingBuffer {
            buf,
            read: 0,
            write: 0,
        }
    }

    pub fn write(&mut self, value: T) -> Result<(), T> {
        let next_write = (self.write + 1) % self.buf.len();
        if next_write == self.read {
            return Err(value);
        }
        self.buf[self.write] = Some(value);
        self.write = next_write;
        Ok(())
    }

    pub fn read(&mut self) -> Option<T> {
        if self.read == self.write {
            return None;
        }
        let value = self.buf[self.read].take();
        self.read = (self.read + 1) % self.buf.len();
        value
    }

    /// Discard the most recently written element. Used by the keyboard to
    /// honor a backspace before the line is consumed.
    pub fn delete_back(&mut self) -> bool {
        if self.read == self.write {
            return false;
        }
        self.write = (self.write + self.buf.len() - 1) % self.buf.len();
        self.buf[self.write] = None;
        true
    }

    pub fn len(&self) -> usize {
        (self.write + self.buf.len() - self.read) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.is_empty());
        rb.write(1).unwrap();
        rb.write(2).unwrap();
        rb.write(3).unwrap();
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.write(4), Err(4));
        assert_eq!(rb.read(), Some(1));
        rb.write(4).unwrap();
        assert_eq!(rb.read(), Some(2));
        assert_eq!(rb.read(), Some(3));
        assert_eq!(rb.read(), Some(4));
        assert_eq!(rb.read(), None);
    }

    #[test]
    fn wraps_without_losing_or_duplicating() {
        let mut rb = RingBuffer::new(3);
        for i in 0..100 {
            rb.write(i).unwrap();
            assert_eq!(rb.read(), Some(i));
        }
        assert!(rb.is_empty());
    }

    #[test]
    fn delete_back_removes_last_write() {
        let mut rb = RingBuffer::new(4);
        assert!(!rb.delete_back());
        rb.write('a').unwrap();
        rb.write('b').unwrap();
        assert!(rb.delete_back());
        rb.write('c').unwrap();
        assert_eq!(rb.read(), Some('a'));
        assert_eq!(rb.read(), Some('c'));
        assert_eq!(rb.read(), None);
    }
}

//! Scrollback storage: the most recent output of a terminal, capped in size.

/// Default scrollback capacity (64 KiB).
pub const DEFAULT_CAPACITY: usize = 64 << 10;

/// Byte FIFO of fixed capacity. Writing past capacity discards the oldest bytes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Index of the oldest stored byte.
    start: usize,
    /// Stored byte count, at most `storage.len()`.
    filled: usize,
    written: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            filled: 0,
            written: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.written += data.len() as u64;
        let cap = self.storage.len();
        if cap == 0 || data.is_empty() {
            return;
        }
        if data.len() >= cap {
            self.storage.copy_from_slice(&data[data.len() - cap..]);
            self.start = 0;
            self.filled = cap;
            return;
        }

        let end = (self.start + self.filled) % cap;
        let head = data.len().min(cap - end);
        self.storage[end..end + head].copy_from_slice(&data[..head]);
        self.storage[..data.len() - head].copy_from_slice(&data[head..]);

        let overflow = (self.filled + data.len()).saturating_sub(cap);
        self.start = (self.start + overflow) % cap;
        self.filled = (self.filled + data.len()).min(cap);
    }

    /// Stored bytes, oldest first, as at most two slices.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        let cap = self.storage.len();
        if self.start + self.filled <= cap {
            (&self.storage[self.start..self.start + self.filled], &[])
        } else {
            let wrapped = self.start + self.filled - cap;
            (&self.storage[self.start..], &self.storage[..wrapped])
        }
    }

    /// Copy of the stored bytes, oldest first.
    pub fn read_all(&self) -> Vec<u8> {
        let (front, back) = self.as_slices();
        let mut out = Vec::with_capacity(self.filled);
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes written since creation or the last clear, evicted ones included.
    pub fn total_written(&self) -> u64 {
        self.written
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.filled = 0;
        self.written = 0;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_everything_below_capacity() {
        let mut rb = RingBuffer::new(16);
        rb.write(b"ls -la\r\n");
        rb.write(b"total 0");
        assert_eq!(rb.read_all(), b"ls -la\r\ntotal 0");
        assert_eq!(rb.len(), 15);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut rb = RingBuffer::new(6);
        rb.write(b"abcd");
        rb.write(b"efgh");
        assert_eq!(rb.read_all(), b"cdefgh");
        let (front, back) = rb.as_slices();
        assert_eq!((front, back), (&b"cdef"[..], &b"gh"[..]));
    }

    #[test]
    fn oversized_write_keeps_tail() {
        let mut rb = RingBuffer::new(4);
        rb.write(b"xy");
        rb.write(b"0123456789");
        assert_eq!(rb.read_all(), b"6789");
        assert_eq!(rb.total_written(), 12);
    }

    #[test]
    fn matches_naive_model() {
        let mut rb = RingBuffer::new(64);
        let mut all = Vec::new();
        for i in 0..50u8 {
            let chunk: Vec<u8> = (0..(i % 7 + 1)).map(|j| i.wrapping_mul(31).wrapping_add(j)).collect();
            rb.write(&chunk);
            all.extend_from_slice(&chunk);
            assert!(rb.len() <= rb.capacity());
            let keep = all.len().min(64);
            assert_eq!(rb.read_all(), &all[all.len() - keep..]);
        }
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut rb = RingBuffer::new(0);
        rb.write(b"dropped");
        assert!(rb.is_empty());
        assert!(rb.read_all().is_empty());
    }

    #[test]
    fn clear_resets() {
        let mut rb = RingBuffer::new(8);
        rb.write(b"abcdefghij");
        rb.clear();
        assert!(rb.is_empty());
        rb.write(b"z");
        assert_eq!(rb.read_all(), b"z");
    }
}

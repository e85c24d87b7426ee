//! Fixed-capacity scrollback of raw terminal output

/// Circular byte store. Reading always yields the most recent
/// `min(written, capacity)` bytes in write order.
pub struct RingBuffer {
    data: Vec<u8>,
    /// Next write position
    cursor: usize,
    /// Valid bytes, never more than capacity
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            cursor: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, overwriting the oldest ones once full
    pub fn write(&mut self, bytes: &[u8]) {
        let cap = self.capacity();

        // Only the tail can survive
        let bytes = if bytes.len() > cap {
            &bytes[bytes.len() - cap..]
        } else {
            bytes
        };

        let first = bytes.len().min(cap - self.cursor);
        self.data[self.cursor..self.cursor + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&bytes[first..]);
        }

        self.cursor = (self.cursor + bytes.len()) % cap;
        self.len = (self.len + bytes.len()).min(cap);
    }

    /// Copy out the valid bytes, oldest first
    pub fn contents(&self) -> Vec<u8> {
        let cap = self.capacity();
        let start = (self.cursor + cap - self.len) % cap;
        let mut out = Vec::with_capacity(self.len);
        if start + self.len <= cap {
            out.extend_from_slice(&self.data[start..start + self.len]);
        } else {
            out.extend_from_slice(&self.data[start..]);
            out.extend_from_slice(&self.data[..self.cursor]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_write_reads_back_exactly() {
        let mut ring = RingBuffer::new(16);
        ring.write(b"hello");
        assert_eq!(ring.contents(), b"hello");
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn test_overflow_keeps_last_capacity_bytes() {
        let mut ring = RingBuffer::new(8);
        let data: Vec<u8> = (0u8..50).collect();
        ring.write(&data);
        assert_eq!(ring.contents(), &data[42..]);
    }

    #[test]
    fn test_wraparound_across_many_writes() {
        let mut ring = RingBuffer::new(10);
        let mut all = Vec::new();
        for i in 0u8..37 {
            let piece = vec![i; (i as usize % 4) + 1];
            ring.write(&piece);
            all.extend_from_slice(&piece);

            let expected_len = all.len().min(10);
            assert_eq!(ring.contents(), &all[all.len() - expected_len..]);
        }
    }

    #[test]
    fn test_exact_capacity_write() {
        let mut ring = RingBuffer::new(4);
        ring.write(b"ab");
        ring.write(b"cdef");
        assert_eq!(ring.contents(), b"cdef");
        ring.write(b"g");
        assert_eq!(ring.contents(), b"defg");
    }

    #[test]
    fn test_empty_buffer() {
        let mut ring = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert!(ring.contents().is_empty());
        ring.write(b"");
        assert!(ring.is_empty());
    }
}

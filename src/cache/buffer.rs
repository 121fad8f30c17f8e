//! Growable write-back buffer with positional access

/// Bytes of one cached file, indexed by file offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheBuffer {
    data: Vec<u8>,
}

impl CacheBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of valid bytes (highest written offset)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Make sure at least `min` bytes are reserved without changing `len`
    pub fn reserve_min(&mut self, min: usize) {
        if self.data.capacity() < min {
            self.data.reserve(min - self.data.len());
        }
    }

    /// Copy `bytes` to `offset`, growing and zero-filling any gap
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> usize {
        let end = offset + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        bytes.len()
    }

    /// Copy up to `buf.len()` bytes starting at `offset`; short at the end
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }

    /// Borrow exactly `len` bytes at `offset`, or None if not fully buffered
    pub fn peek(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }

    /// Shrink to `len` valid bytes (no-op when already shorter)
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_writes_fill_gaps() {
        let mut buf = CacheBuffer::new();
        buf.write_at(4, b"tail");
        buf.write_at(0, b"head");
        assert_eq!(buf.as_slice(), b"headtail");

        buf.write_at(10, b"x");
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf.as_slice()[8..10], &[0, 0]);
    }

    #[test]
    fn reserve_keeps_length() {
        let mut buf = CacheBuffer::new();
        buf.reserve_min(4096);
        assert!(buf.capacity() >= 4096);
        assert!(buf.is_empty());
    }

    #[test]
    fn write_past_reserved_capacity() {
        let mut buf = CacheBuffer::new();
        buf.reserve_min(4096);
        let data: Vec<u8> = (0..4100u32).map(|i| (i % 251) as u8).collect();

        assert_eq!(buf.write_at(0, &data), 4100);
        assert_eq!(buf.as_slice(), data.as_slice());
    }

    #[test]
    fn read_is_short_at_end() {
        let mut buf = CacheBuffer::new();
        buf.write_at(0, b"abcdef");

        let mut out = [0u8; 4];
        assert_eq!(buf.read_at(4, &mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(buf.read_at(6, &mut out), 0);
    }

    #[test]
    fn peek_requires_full_range() {
        let mut buf = CacheBuffer::new();
        buf.write_at(0, b"abc");
        assert_eq!(buf.peek(1, 2), Some(&b"bc"[..]));
        assert_eq!(buf.peek(2, 2), None);
        assert_eq!(buf.peek(usize::MAX, 2), None);
    }
}

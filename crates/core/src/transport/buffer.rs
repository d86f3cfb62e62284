use std::io::{self, Read};

/// Contiguous receive buffer with `begin <= end <= capacity`.
///
/// Bytes in `begin..end` are unread. When more space is needed and
/// `begin > 0`, the unread region is compacted to offset 0 before the
/// buffer grows.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
    begin: usize,
    end: usize,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(1)],
            begin: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Mark `n` unread bytes as consumed. Clamped to what is unread.
    pub fn consume(&mut self, n: usize) {
        self.begin = (self.begin + n).min(self.end);
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    /// Writable region of exactly `n` bytes after the unread data.
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        if self.data.len() - self.end < n {
            if self.begin > 0 {
                self.data.copy_within(self.begin..self.end, 0);
                self.end -= self.begin;
                self.begin = 0;
            }
            if self.data.len() - self.end < n {
                self.data.resize(self.end + n, 0);
            }
        }
        &mut self.data[self.end..self.end + n]
    }

    /// Record `n` bytes written into the last [`reserve`](Self::reserve)d region.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.data.len());
    }

    /// One read of at most `max` bytes. Returns the byte count (0 on EOF).
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let n = reader.read(self.reserve(max.max(1)))?;
        self.commit(n);
        Ok(n)
    }
}

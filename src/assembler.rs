use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

/// Helper to assemble unordered frames of an ordered byte stream
///
/// Chunks may arrive duplicated, overlapping, or out of order; `read` only
/// ever yields bytes in stream order, holding gaps until they are filled.
#[derive(Debug, Default)]
pub struct Assembler {
    /// Offset of the next byte to be read
    offset: u64,
    data: BTreeMap<u64, Bytes>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, offset: u64, bytes: Bytes) {
        if bytes.is_empty() || offset + bytes.len() as u64 <= self.offset {
            return;
        }
        match self.data.get(&offset) {
            // At equal offsets, the longer chunk supersedes the shorter
            Some(existing) if existing.len() >= bytes.len() => {}
            _ => {
                self.data.insert(offset, bytes);
            }
        }
    }

    /// Copy as many in-order bytes as are available into `buf`, advancing the stream
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let (&chunk_offset, chunk) = match self.data.iter_mut().next() {
                Some(x) => x,
                None => break,
            };
            if chunk_offset > self.offset {
                // Gap not yet filled
                break;
            }
            let end = chunk_offset + chunk.len() as u64;
            if end <= self.offset {
                // Wholly duplicated data
                self.data.remove(&chunk_offset);
                continue;
            }
            // Skip any prefix that was already delivered by an overlapping chunk
            chunk.advance((self.offset - chunk_offset) as usize);
            let len = chunk.len().min(buf.len() - read);
            buf[read..read + len].copy_from_slice(&chunk[..len]);
            read += len;
            self.offset += len as u64;
            if len == chunk.len() {
                self.data.remove(&chunk_offset);
            } else {
                let rest = chunk.slice(len..);
                self.data.remove(&chunk_offset);
                self.data.insert(self.offset, rest);
            }
        }
        read
    }

    /// Current position in the stream
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Discard all buffered data
    pub fn clear(&mut self) {
        self.data.clear();
    }

    #[cfg(test)]
    fn next(&mut self, size: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0; size];
        let read = self.read(&mut buf);
        if read == 0 {
            return None;
        }
        buf.truncate(read);
        Some(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn ordered() {
        let mut x = Assembler::new();
        assert_matches!(x.next(32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(x.next(1), Some(ref y) if &y[..] == b"1");
        assert_matches!(x.next(3), Some(ref y) if &y[..] == b"23");
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"456");
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"78910");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn unordered() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(x.next(32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"123456");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn duplicate() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"123");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn contained() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12345"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"12345");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn contains() {
        let mut x = Assembler::new();
        x.insert(1, Bytes::from_static(b"234"));
        x.insert(0, Bytes::from_static(b"12345"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"12345");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn overlapping() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"1234");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn complex() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1"));
        x.insert(2, Bytes::from_static(b"3"));
        x.insert(4, Bytes::from_static(b"5"));
        x.insert(0, Bytes::from_static(b"123456"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"123456");
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn old_data() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(x.next(32), Some(ref y) if &y[..] == b"1234");
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(x.next(32), None);
    }

    #[test]
    fn clear_drops_buffered() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12"));
        x.clear();
        assert_matches!(x.next(32), None);
    }
}

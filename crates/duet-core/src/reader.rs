//! Sequential reader over binary index data

use crate::{Error, Result};

/// Cursor over a byte slice yielding fixed-width big-endian integers
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read an unsigned integer of `n` bytes (at most 8), most significant byte first
    pub fn read_uint(&mut self, n: usize) -> Result<u64> {
        debug_assert!(n <= 8);
        let bytes = self.read_bytes(n)?;
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_uint(2)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_uint(4)? as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    /// Borrow the next `n` bytes and advance past them
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_most_significant_first() {
        let data = [0x00, 0x01, 0x02, 0x03, 0xff, 0x10, 0x20];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_u32().unwrap(), 0x0001_0203);
        assert_eq!(reader.read_u8().unwrap(), 0xff);
        assert_eq!(reader.read_u16().unwrap(), 0x1020);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_odd_widths() {
        let data = [0x01, 0x00, 0x00, 0x02];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.read_uint(1).unwrap(), 1);
        assert_eq!(reader.read_uint(3).unwrap(), 2);
    }

    #[test]
    fn test_truncation_does_not_advance() {
        let data = [0x01, 0x02];
        let mut reader = ByteReader::new(&data);
        let err = reader.read_u32().unwrap_err();
        assert!(matches!(err, Error::Truncated { offset: 0, needed: 4, available: 2 }));
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.rest(), &[0x01, 0x02]);
    }
}

// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A bounds-checked view over a byte buffer with a movable offset.
//!
//! The pickler uses it to patch frame headers into its output buffer, the
//! unpickler to consume prefetched frames.

use byteorder::{ByteOrder, BigEndian, LittleEndian};

/// An access beyond the end of the backing buffer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[error("out of bounds: {needed} bytes at offset {offset}, buffer holds {len}")]
pub struct OutOfBounds {
    pub offset: usize,
    pub needed: usize,
    pub len: usize,
}

pub type CursorResult<T> = Result<T, OutOfBounds>;

#[derive(Clone, Debug)]
pub struct BufferCursor<B> {
    buf: B,
    offset: usize,
}

impl<B: AsRef<[u8]>> BufferCursor<B> {
    pub fn new(buf: B) -> BufferCursor<B> {
        BufferCursor { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize { self.offset }

    pub fn len(&self) -> usize { self.buf.as_ref().len() }

    pub fn remaining(&self) -> usize { self.len() - self.offset }

    pub fn is_exhausted(&self) -> bool { self.remaining() == 0 }

    pub fn into_inner(self) -> B { self.buf }

    fn check(&self, n: usize) -> CursorResult<usize> {
        match self.offset.checked_add(n) {
            Some(end) if end <= self.len() => Ok(end),
            _ => Err(OutOfBounds { offset: self.offset, needed: n, len: self.len() }),
        }
    }

    pub fn advance(&mut self, n: usize) -> CursorResult<()> {
        self.offset = self.check(n)?;
        Ok(())
    }

    pub fn retreat(&mut self, n: usize) -> CursorResult<()> {
        if n > self.offset {
            return Err(OutOfBounds { offset: self.offset, needed: n, len: self.len() });
        }
        self.offset -= n;
        Ok(())
    }

    /// Borrows the next `n` bytes and moves past them.
    ///
    /// Slices never copy; the returned bytes live as long as the borrow of
    /// the cursor.
    pub fn read_bytes(&mut self, n: usize) -> CursorResult<&[u8]> {
        let start = self.offset;
        self.offset = self.check(n)?;
        Ok(&self.buf.as_ref()[start..self.offset])
    }

    /// Reads up to and including the next newline; the newline is not part
    /// of the result.  Returns `None` if no newline follows.
    pub fn read_line(&mut self) -> Option<&[u8]> {
        let rest = &self.buf.as_ref()[self.offset..];
        let pos = rest.iter().position(|&b| b == b'\n')?;
        let start = self.offset;
        self.offset += pos + 1;
        Some(&self.buf.as_ref()[start..start + pos])
    }

    pub fn read_u8(&mut self) -> CursorResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> CursorResult<u16> {
        self.read_bytes(2).map(LittleEndian::read_u16)
    }

    pub fn read_u32_le(&mut self) -> CursorResult<u32> {
        self.read_bytes(4).map(LittleEndian::read_u32)
    }

    pub fn read_i32_le(&mut self) -> CursorResult<i32> {
        self.read_bytes(4).map(LittleEndian::read_i32)
    }

    pub fn read_u64_le(&mut self) -> CursorResult<u64> {
        self.read_bytes(8).map(LittleEndian::read_u64)
    }

    pub fn read_f64_be(&mut self) -> CursorResult<f64> {
        self.read_bytes(8).map(BigEndian::read_f64)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BufferCursor<B> {
    pub fn write_bytes(&mut self, data: &[u8]) -> CursorResult<()> {
        let start = self.offset;
        let end = self.check(data.len())?;
        self.buf.as_mut()[start..end].copy_from_slice(data);
        self.offset = end;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> CursorResult<()> {
        self.write_bytes(&[value])
    }

    pub fn write_u32_le(&mut self, value: u32) -> CursorResult<()> {
        let mut bytes = [0; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.write_bytes(&bytes)
    }

    pub fn write_u64_le(&mut self, value: u64) -> CursorResult<()> {
        let mut bytes = [0; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.write_bytes(&bytes)
    }

    /// Moves `n` bytes starting at absolute position `src` to the cursor
    /// offset (regions may overlap), and advances past them.
    pub fn shift(&mut self, src: usize, n: usize) -> CursorResult<()> {
        let len = self.len();
        match src.checked_add(n) {
            Some(src_end) if src_end <= len => {}
            _ => return Err(OutOfBounds { offset: src, needed: n, len }),
        }
        let dst = self.offset;
        let end = self.check(n)?;
        self.buf.as_mut().copy_within(src..src + n, dst);
        self.offset = end;
        Ok(())
    }
}

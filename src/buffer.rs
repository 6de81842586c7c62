//! Wire buffer shared by the encoder, the decoder and the transport.

use std::io::{self, IoSlice, Write};

/// Append-only byte buffer addressed by absolute stream positions.
///
/// A position (`u64`) names a byte of the whole stream ever written
/// to the buffer, so it stays valid across reallocations and across
/// later appends. Positions before [`Buffer::begin`] refer to bytes
/// already [consumed](Buffer::consume) and must not be used anymore.
///
/// The buffer is owned by the caller and outlives any encoder or
/// decoder working on it. Tuples decoded out of a response borrow
/// into the buffer by position, which is why the front may only be
/// consumed once the response has been fully processed.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    /// Stream position of `data[0]`.
    base: u64,
    /// Length of the content; `data` may be longer while a tail
    /// reservation is outstanding.
    len: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Buffer {
            data: Vec::with_capacity(cap),
            base: 0,
            len: 0,
        }
    }

    /// Wrap an already-filled chunk, positions starting at 0.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Buffer { data, base: 0, len }
    }

    /// Position of the first retained byte.
    #[inline]
    pub fn begin(&self) -> u64 {
        self.base
    }

    /// Position one past the last written byte. Stable: appending
    /// never moves positions handed out earlier.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn idx(&self, pos: u64) -> usize {
        debug_assert!(pos >= self.base, "position before buffer start");
        debug_assert!(pos <= self.end(), "position past buffer end");
        (pos - self.base) as usize
    }

    pub fn write_u8(&mut self, b: u8) {
        self.data.truncate(self.len);
        self.data.push(b);
        self.len = self.data.len();
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_slice(&v.to_be_bytes());
    }

    pub fn write_slice(&mut self, s: &[u8]) {
        self.data.truncate(self.len);
        self.data.extend_from_slice(s);
        self.len = self.data.len();
    }

    /// Patch 4 already-written bytes at `pos` with a big-endian word.
    /// Used to back-fill the length placeholder of a framed request.
    pub fn set_u32_be(&mut self, pos: u64, v: u32) {
        let i = self.idx(pos);
        self.data[i..i + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Overwrite already-written bytes at `pos`. The region must lie
    /// entirely within the buffer.
    pub fn patch_slice(&mut self, pos: u64, bytes: &[u8]) {
        let i = self.idx(pos);
        assert!(i + bytes.len() <= self.len, "patch past buffer end");
        self.data[i..i + bytes.len()].copy_from_slice(bytes);
    }

    pub fn slice(&self, start: u64, end: u64) -> &[u8] {
        &self.data[self.idx(start)..self.idx(end)]
    }

    pub fn slice_from(&self, start: u64) -> &[u8] {
        &self.data[self.idx(start)..self.len]
    }

    /// The whole retained content.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The readable region as an iovec list for a vectored send.
    /// The content is contiguous, so one slice covers all of it.
    #[inline]
    pub fn io_slices(&self) -> [IoSlice<'_>; 1] {
        [IoSlice::new(self.readable())]
    }

    /// Discard `n` bytes from the front. Positions below the new
    /// [`begin`](Buffer::begin) become invalid.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consuming more than is buffered");
        self.data.drain(..n);
        self.base += n as u64;
        self.len -= n;
    }

    /// Drop everything written at or after `pos`. Used to roll a
    /// half-encoded packet back out of the buffer.
    pub(crate) fn truncate_to(&mut self, pos: u64) {
        let i = self.idx(pos);
        self.data.truncate(i);
        self.len = i;
    }

    /// Expose `n` spare bytes past the content for a `recv` to fill.
    /// Bytes become part of the content only after [`Buffer::commit`].
    pub fn reserve_tail(&mut self, n: usize) -> &mut [u8] {
        if self.data.len() < self.len + n {
            self.data.resize(self.len + n, 0);
        }
        let start = self.len;
        &mut self.data[start..start + n]
    }

    /// Account `n` bytes previously exposed by `reserve_tail`.
    pub fn commit(&mut self, n: usize) {
        assert!(self.len + n <= self.data.len(), "commit past reservation");
        self.len += n;
    }
}

impl Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

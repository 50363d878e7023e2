//! # Overlay Buffer
//!
//! Append-only byte writer with checkpoint/rewind and a hard size limit,
//! plus a read-side cursor for parsing received payloads.
//!
//! The writer is transactional at two granularities:
//!
//! - every append checks the limit **before** touching the buffer, so a
//!   failed append leaves the contents exactly as they were;
//! - [`OverlayBuffer::checkpoint`] / [`OverlayBuffer::rewind`] let a caller
//!   abort a partially written record and fall back to the last known-good
//!   position.

use bytes::BytesMut;

use crate::OverlayError;

// ─── Writer ─────────────────────────────────────────────────────────────────

/// Append-only byte writer with a bounded capacity.
#[derive(Debug, Clone)]
pub struct OverlayBuffer {
    bytes: BytesMut,
    limit: usize,
    checkpoint: usize,
}

impl OverlayBuffer {
    /// Create an unbounded buffer.
    pub fn new() -> Self {
        OverlayBuffer {
            bytes: BytesMut::new(),
            limit: usize::MAX,
            checkpoint: 0,
        }
    }

    /// Create a buffer that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        OverlayBuffer {
            bytes: BytesMut::with_capacity(limit),
            limit,
            checkpoint: 0,
        }
    }

    /// Tighten (or widen) the size limit. Bytes already written are kept
    /// even if they exceed the new limit; only future appends are checked.
    pub fn limit_size(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Number of bytes written so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes still available before the limit is hit.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.bytes.len())
    }

    #[inline]
    fn ensure(&self, extra: usize) -> Result<(), OverlayError> {
        if self.bytes.len() + extra > self.limit {
            return Err(OverlayError::BufferFull);
        }
        Ok(())
    }

    /// Append a single byte.
    pub fn append_byte(&mut self, byte: u8) -> Result<(), OverlayError> {
        self.ensure(1)?;
        self.bytes.extend_from_slice(&[byte]);
        Ok(())
    }

    /// Append a 16-bit integer, big-endian.
    pub fn append_u16_be(&mut self, value: u16) -> Result<(), OverlayError> {
        self.ensure(2)?;
        self.bytes.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Append a 32-bit integer, big-endian.
    pub fn append_u32_be(&mut self, value: u32) -> Result<(), OverlayError> {
        self.ensure(4)?;
        self.bytes.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Append a byte slice.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), OverlayError> {
        self.ensure(data.len())?;
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Append a 32-bit integer in 7-bit groups, least significant first,
    /// high bit of each byte flagging a continuation.
    pub fn append_packed_u32(&mut self, value: u32) -> Result<(), OverlayError> {
        let mut len = 1;
        let mut probe = value >> 7;
        while probe != 0 {
            len += 1;
            probe >>= 7;
        }
        self.ensure(len)?;
        let mut v = value;
        loop {
            let more = v > 0x7f;
            self.bytes
                .extend_from_slice(&[(v & 0x7f) as u8 | if more { 0x80 } else { 0 }]);
            v >>= 7;
            if !more {
                break;
            }
        }
        Ok(())
    }

    /// Overwrite a previously written byte. Used to back-patch record
    /// lengths once the record is complete.
    pub fn set(&mut self, offset: usize, byte: u8) -> Result<(), OverlayError> {
        if offset >= self.bytes.len() {
            return Err(OverlayError::BufferFull);
        }
        self.bytes[offset] = byte;
        Ok(())
    }

    /// Mark the current position as the rewind target.
    pub fn checkpoint(&mut self) {
        self.checkpoint = self.bytes.len();
    }

    /// Drop everything written since the last checkpoint.
    pub fn rewind(&mut self) {
        self.bytes.truncate(self.checkpoint);
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for OverlayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

/// Read cursor over a received payload. All reads return `None` on
/// truncation; [`BufferReader::seek`] clamps to the end of the data so a
/// lying length field terminates the surrounding record loop instead of
/// re-reading stale bytes.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BufferReader { data, pos: 0 }
    }

    /// Current read offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Jump to an absolute offset, clamped to the end of the data.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// Read one byte.
    pub fn get_byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    /// Read a big-endian 16-bit integer.
    pub fn get_u16_be(&mut self) -> Option<u16> {
        let raw = self.get_bytes(2)?;
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// Read a big-endian 32-bit integer.
    pub fn get_u32_be(&mut self) -> Option<u32> {
        let raw = self.get_bytes(4)?;
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a 7-bit-group packed integer (see
    /// [`OverlayBuffer::append_packed_u32`]).
    pub fn get_packed_u32(&mut self) -> Option<u32> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.get_byte()?;
            if shift >= 32 {
                return None;
            }
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }

    /// Read `len` raw bytes.
    pub fn get_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Writer Tests ───────────────────────────────────────────────────

    #[test]
    fn typed_appends() {
        let mut buf = OverlayBuffer::new();
        buf.append_byte(0xAB).unwrap();
        buf.append_u16_be(0x0102).unwrap();
        buf.append_u32_be(0xDEADBEEF).unwrap();
        buf.append_bytes(b"xy").unwrap();
        assert_eq!(
            buf.as_slice(),
            &[0xAB, 0x01, 0x02, 0xDE, 0xAD, 0xBE, 0xEF, b'x', b'y']
        );
        assert_eq!(buf.position(), 9);
    }

    #[test]
    fn limit_rejects_without_partial_write() {
        let mut buf = OverlayBuffer::with_limit(3);
        buf.append_u16_be(7).unwrap();
        // 2 bytes used, a u32 needs 4 more
        assert_eq!(buf.append_u32_be(1), Err(OverlayError::BufferFull));
        assert_eq!(buf.position(), 2, "failed append must not write anything");
        buf.append_byte(9).unwrap();
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn checkpoint_rewind_restores() {
        let mut buf = OverlayBuffer::new();
        buf.append_bytes(b"keep").unwrap();
        buf.checkpoint();
        buf.append_bytes(b"discard").unwrap();
        buf.rewind();
        assert_eq!(buf.as_slice(), b"keep");
        // rewind is idempotent
        buf.rewind();
        assert_eq!(buf.as_slice(), b"keep");
    }

    #[test]
    fn set_patches_written_byte_only() {
        let mut buf = OverlayBuffer::new();
        buf.append_bytes(&[0, 1, 2]).unwrap();
        buf.set(0, 9).unwrap();
        assert_eq!(buf.as_slice(), &[9, 1, 2]);
        assert!(buf.set(3, 0).is_err());
    }

    #[test]
    fn packed_u32_roundtrip() {
        for value in [0u32, 1, 0x7f, 0x80, 300, 16_383, 16_384, u32::MAX] {
            let mut buf = OverlayBuffer::new();
            buf.append_packed_u32(value).unwrap();
            let mut r = BufferReader::new(buf.as_slice());
            assert_eq!(r.get_packed_u32(), Some(value), "value {value}");
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn packed_u32_respects_limit_atomically() {
        let mut buf = OverlayBuffer::with_limit(1);
        // 300 needs two bytes
        assert_eq!(buf.append_packed_u32(300), Err(OverlayError::BufferFull));
        assert_eq!(buf.position(), 0);
        buf.append_packed_u32(0x40).unwrap();
    }

    // ─── Reader Tests ───────────────────────────────────────────────────

    #[test]
    fn reader_truncation_returns_none() {
        let mut r = BufferReader::new(&[1, 2, 3]);
        assert_eq!(r.get_u16_be(), Some(0x0102));
        assert_eq!(r.get_u32_be(), None);
        // failed multi-byte read keeps the cursor usable
        assert_eq!(r.get_byte(), Some(3));
        assert_eq!(r.get_byte(), None);
    }

    #[test]
    fn reader_seek_clamps() {
        let mut r = BufferReader::new(&[1, 2, 3]);
        r.seek(100);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.get_byte(), None);
    }
}

//! Sequential little-endian reader/writer over a growable byte buffer.
//!
//! Every wire-level field in this protocol is a fixed-width little-endian
//! integer or a NUL-terminated string, so unlike a tag-prefixed protocol there
//! is no need for a `Tag` discriminant byte ahead of each value: callers know
//! the shape of the frame they're decoding and call the matching `read_*`.

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;

use super::error::ProtocolError;

/// Reads fixed-width fields out of a byte slice, advancing a cursor.
///
/// A short read (not enough bytes remaining for the requested field) returns
/// [`ProtocolError::ShortRead`], which callers treat as "come back once more
/// data has arrived" rather than a fatal decode error.
#[derive(Debug)]
pub struct BufferReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    /// Wraps `buf` for reading from the start.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes remaining to be read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::ShortRead);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `u32`, little-endian.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Reads an `i32`, little-endian.
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    /// Reads an `i64`, little-endian.
    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Reads a `bool` stored as a single byte (`0` is false, anything else is
    /// true).
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads bytes up to (and consuming) the next NUL, returning the
    /// preceding bytes decoded as UTF-8.
    pub fn read_cstring(&mut self) -> Result<String, ProtocolError> {
        let nul_offset = self.buf[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::ShortRead)?;

        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + nul_offset])
            .map_err(|e| ProtocolError::Invalid(format!("non-utf8 cstring: {e}")))?
            .to_owned();

        self.pos += nul_offset + 1;
        Ok(s)
    }

    /// Reads a `u32` and decodes it as an enum `T`, failing with
    /// [`ProtocolError::UnknownDiscriminant`] if the value has no matching
    /// variant.
    pub fn read_enum<T: FromPrimitive>(&mut self, field: &'static str) -> Result<T, ProtocolError> {
        let value = self.read_u32()?;
        T::from_u32(value).ok_or(ProtocolError::UnknownDiscriminant { field, value })
    }

    /// Reads a `u8` and decodes it as an enum `T`.
    pub fn read_enum_u8<T: FromPrimitive>(&mut self, field: &'static str) -> Result<T, ProtocolError> {
        let value = self.read_u8()? as u32;
        T::from_u32(value).ok_or(ProtocolError::UnknownDiscriminant { field, value })
    }
}

/// Builds up a frame body, then lets the header be prepended once the body's
/// length is known.
#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    /// An empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the accumulated bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Appends a `u32`, little-endian.
    pub fn write_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    /// Appends an `i32`, little-endian.
    pub fn write_i32(&mut self, v: i32) {
        let mut b = [0u8; 4];
        LittleEndian::write_i32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    /// Appends an `i64`, little-endian.
    pub fn write_i64(&mut self, v: i64) {
        let mut b = [0u8; 8];
        LittleEndian::write_i64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    /// Appends a `bool` as a single byte.
    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    /// Appends `s` followed by a NUL terminator.
    pub fn write_cstring(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Inserts `v` (little-endian) at the very front of the buffer, shifting
    /// everything already written. Used to backfill `packet_length` once the
    /// body's size is known.
    pub fn insert_u32_at_front(&mut self, v: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.splice(0..0, b);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::codes::CommandCode;

    #[test]
    fn roundtrip_primitives() {
        let mut w = BufferWriter::new();
        w.write_u8(7);
        w.write_u32(0xdead_beef);
        w.write_i32(-42);
        w.write_i64(-1);
        w.write_bool(true);
        w.write_cstring("pkg:/source/main.brs");

        let buf = w.into_vec();
        let mut r = BufferReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_i64().unwrap(), -1);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_cstring().unwrap(), "pkg:/source/main.brs");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_read_is_recoverable() {
        let buf = [1u8, 2, 3];
        let mut r = BufferReader::new(&buf);
        let err = r.read_u32().unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn cstring_without_terminator_is_short_read() {
        let buf = b"no terminator here";
        let mut r = BufferReader::new(buf);
        assert!(matches!(r.read_cstring(), Err(ProtocolError::ShortRead)));
    }

    #[test]
    fn insert_u32_at_front_prepends_header() {
        let mut w = BufferWriter::new();
        w.write_u32(CommandCode::Threads as u32);
        let body_len = w.as_slice().len() as u32;
        w.insert_u32_at_front(body_len);

        let buf = w.into_vec();
        let mut r = BufferReader::new(&buf);
        assert_eq!(r.read_u32().unwrap(), body_len);
        assert_eq!(r.read_u32().unwrap(), CommandCode::Threads as u32);
    }
}

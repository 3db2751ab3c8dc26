//! Protocol messages
//!
//! A [`Frame`] is one command byte plus an opaque payload. Game code builds
//! outbound frames with [`FrameBuilder`] and parses inbound ones with
//! [`FrameReader`]; both use big-endian integers.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

/// An immutable protocol message. Cloning shares the payload buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    command: i8,
    payload: Bytes,
}

impl Frame {
    pub fn new(command: i8, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn empty(command: i8) -> Self {
        Self::new(command, Bytes::new())
    }

    pub fn builder(command: i8) -> FrameBuilder {
        FrameBuilder::new(command)
    }

    pub fn command(&self) -> i8 {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            buf: self.payload.clone(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("command", &self.command)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Growable buffer for an outbound frame.
#[derive(Debug)]
pub struct FrameBuilder {
    command: i8,
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn new(command: i8) -> Self {
        Self {
            command,
            buf: BytesMut::new(),
        }
    }

    pub fn write_i8(mut self, v: i8) -> Self {
        self.buf.put_i8(v);
        self
    }

    pub fn write_u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_bool(self, v: bool) -> Self {
        self.write_u8(v as u8)
    }

    pub fn write_i16(mut self, v: i16) -> Self {
        self.buf.put_i16(v);
        self
    }

    pub fn write_u16(mut self, v: u16) -> Self {
        self.buf.put_u16(v);
        self
    }

    pub fn write_i32(mut self, v: i32) -> Self {
        self.buf.put_i32(v);
        self
    }

    pub fn write_i64(mut self, v: i64) -> Self {
        self.buf.put_i64(v);
        self
    }

    /// u16 length prefix followed by the UTF-8 bytes. Strings longer than
    /// 65535 bytes are cut at the last char boundary that fits.
    pub fn write_utf(mut self, s: &str) -> Self {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.put_u16(end as u16);
        self.buf.put_slice(&s.as_bytes()[..end]);
        self
    }

    pub fn write_bytes(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn build(self) -> Frame {
        Frame {
            command: self.command,
            payload: self.buf.freeze(),
        }
    }
}

/// Cursor over an inbound frame's payload.
#[derive(Debug, Clone)]
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    fn need(&self, needed: usize) -> Result<(), ReadError> {
        if self.buf.remaining() < needed {
            return Err(ReadError::Truncated {
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn read_i8(&mut self) -> Result<i8, ReadError> {
        self.need(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ReadError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16, ReadError> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_i32(&mut self) -> Result<i32, ReadError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ReadError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_utf(&mut self) -> Result<String, ReadError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ReadError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, ReadError> {
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_writes_big_endian() {
        let frame = Frame::builder(5)
            .write_i16(0x1234)
            .write_i32(-2)
            .write_bool(true)
            .build();
        assert_eq!(frame.command(), 5);
        assert_eq!(frame.payload(), &[0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFE, 0x01]);
    }

    #[test]
    fn test_reader_walks_fields() {
        let frame = Frame::builder(-3)
            .write_u8(9)
            .write_utf("héllo")
            .write_i64(1 << 40)
            .write_bytes(b"tail")
            .build();

        let mut r = frame.reader();
        assert_eq!(r.read_u8().unwrap(), 9);
        assert_eq!(r.read_utf().unwrap(), "héllo");
        assert_eq!(r.read_i64().unwrap(), 1 << 40);
        assert_eq!(&r.rest()[..], b"tail");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let frame = Frame::new(1, vec![0x00]);
        let mut r = frame.reader();
        assert_eq!(
            r.read_i32(),
            Err(ReadError::Truncated { needed: 4, available: 1 })
        );
        // failed read consumes nothing
        assert_eq!(r.read_u8().unwrap(), 0);
    }

    #[test]
    fn test_utf_rejects_invalid_bytes() {
        let frame = Frame::new(1, vec![0x00, 0x02, 0xC3, 0x28]);
        assert_eq!(frame.reader().read_utf(), Err(ReadError::InvalidUtf8));
    }

    #[test]
    fn test_clone_shares_payload() {
        let frame = Frame::new(7, b"shared".to_vec());
        let copy = frame.clone();
        assert_eq!(copy.payload().as_ptr(), frame.payload().as_ptr());
        assert_eq!(format!("{:?}", copy), "Frame { command: 7, len: 6 }");
    }
}

//! Byte-level codec helpers for protocol messages and persisted records.
//!
//! All wire structures share one scheme: a leading format-version byte,
//! fixed-width big-endian integers, and `u32`-length-prefixed byte strings.
//! Decoding is strict: trailing garbage, short buffers, and unknown versions
//! are all errors, so a corrupt header or cell can never be half-read.

use bytes::{BufMut, Bytes, BytesMut};

/// Error produced when a wire structure cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub message: String,
}

impl DecodeError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "decode error: {}", self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Cursor over an immutable byte slice with checked reads.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::new(format!(
                "short buffer: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.take(8)?;
        Ok(u64::from_be_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::new(format!("invalid bool byte: {}", other))),
        }
    }

    /// Reads a `u32`-length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Reads a `u32`-length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::new("invalid utf-8 string"))
    }

    /// Fails unless the buffer has been fully consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::new(format!(
                "{} trailing bytes after message",
                self.buf.len()
            )))
        }
    }

    /// Checks the leading format-version byte.
    pub fn version(&mut self, expected: u8) -> Result<(), DecodeError> {
        let found = self.u8()?;
        if found != expected {
            return Err(DecodeError::new(format!(
                "unsupported format version {} (expected {})",
                found, expected
            )));
        }
        Ok(())
    }
}

/// Growable message builder mirroring [`Reader`].
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new(version: u8) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u8(version);
        Self { buf }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.put_u32(v);
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.put_u64(v);
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(u8::from(v))
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn string(self, v: &str) -> Self {
        self.bytes(v.as_bytes())
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_scalar_fields() {
        // given
        let msg = Writer::new(1)
            .u64(u64::MAX)
            .u32(7)
            .bool(true)
            .string("prefix")
            .build();

        // when
        let mut r = Reader::new(&msg);

        // then
        r.version(1).unwrap();
        assert_eq!(r.u64().unwrap(), u64::MAX);
        assert_eq!(r.u32().unwrap(), 7);
        assert!(r.bool().unwrap());
        assert_eq!(r.string().unwrap(), "prefix");
        r.finish().unwrap();
    }

    #[test]
    fn should_reject_short_buffer() {
        let mut r = Reader::new(&[0x01, 0x02]);
        r.version(1).unwrap();
        assert!(r.u64().is_err());
    }

    #[test]
    fn should_reject_wrong_version() {
        let msg = Writer::new(2).u64(1).build();
        let mut r = Reader::new(&msg);
        assert!(r.version(1).is_err());
    }

    #[test]
    fn should_reject_trailing_bytes() {
        let msg = Writer::new(1).u64(1).u8(9).build();
        let mut r = Reader::new(&msg);
        r.version(1).unwrap();
        r.u64().unwrap();
        assert!(r.finish().is_err());
    }

    #[test]
    fn should_reject_invalid_bool() {
        let mut r = Reader::new(&[7]);
        assert!(r.bool().is_err());
    }
}

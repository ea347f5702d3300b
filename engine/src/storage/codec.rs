//! Little-endian encoding helpers for block payloads.
//!
//! Encoded payloads end with a CRC32 of everything before it. `Encoder::finish`
//! appends the checksum and `Decoder::checked` verifies and strips it.

#![allow(clippy::cast_possible_truncation)]

/// Errors produced while decoding a block payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid tag {tag} for {field}")]
    InvalidTag { field: &'static str, tag: u8 },
    #[error("invalid field {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Appends fields to a growing buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn bool(&mut self, value: bool) {
        self.u8(u8::from(value));
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32) byte string.
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.u32(bytes.len() as u32);
        self.raw(bytes);
    }

    /// Seal the payload with a trailing CRC32.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let crc = checksum(&self.buf);
        self.u32(crc);
        self.buf
    }
}

/// Reads fields back out of a payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    /// Verify the trailing checksum and return a decoder over the body.
    pub fn checked(payload: &'a [u8]) -> Result<Self, DecodeError> {
        let Some(body_len) = payload.len().checked_sub(CHECKSUM_SIZE) else {
            return Err(DecodeError::Truncated {
                offset: 0,
                needed: CHECKSUM_SIZE,
            });
        };
        let (body, trailer) = payload.split_at(body_len);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = checksum(body);
        if stored != computed {
            return Err(DecodeError::ChecksumMismatch { stored, computed });
        }
        Ok(Self {
            buf: body,
            offset: 0,
        })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: len,
            });
        };
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::InvalidTag { field, tag }),
        }
    }

    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.take(len)
    }

    /// Length-prefixed (u32) byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        let remaining = self.buf.len() - self.offset;
        if remaining == 0 {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(remaining))
        }
    }
}

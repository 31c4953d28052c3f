//! Little-endian wire helpers shared by every signed message.
//!
//! Messages are built with [`Writer`] (serialize-to-sign, then append the
//! signature) and parsed with [`Reader`], which fails on truncation instead of
//! panicking.

use crate::crypto::{Hash, Signature, Token, HASH_SIZE, SIGNATURE_SIZE, TOKEN_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unexpected message kind {found}, expected {expected}")]
    UnexpectedKind { expected: u8, found: u8 },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("field too long for its length prefix: {0} bytes")]
    Oversized(usize),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid field: {0}")]
    Invalid(&'static str),
}

#[derive(Default, Debug, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_kind(kind: u8) -> Self {
        let mut writer = Self::new();
        writer.put_u8(kind);
        writer
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_token(&mut self, token: &Token) {
        self.buf.extend_from_slice(&token.0);
    }

    pub fn put_hash(&mut self, hash: &Hash) {
        self.buf.extend_from_slice(&hash.0);
    }

    pub fn put_signature(&mut self, signature: &Signature) {
        self.buf.extend_from_slice(&signature.0);
    }

    /// Raw bytes with no length prefix.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Byte array with a u32 length prefix.
    pub fn put_byte_array(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    /// Byte array with a u16 length prefix. Longer inputs are rejected.
    pub fn put_short_byte_array(&mut self, data: &[u8]) -> Result<(), WireError> {
        let len = u16::try_from(data.len()).map_err(|_| WireError::Oversized(data.len()))?;
        self.put_u16(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Text as a short byte array, cut to fit on a char boundary. Constructors
    /// clamp their text with [`clamp_short`] first so the cut never applies.
    pub fn put_short_str(&mut self, text: &str) {
        let text = clamp_short(text);
        self.put_u16(text.len() as u16);
        self.buf.extend_from_slice(text.as_bytes());
    }

    /// u32 count followed by each item as a byte array.
    pub fn put_array<T: AsRef<[u8]>>(&mut self, items: &[T]) {
        self.put_u32(items.len() as u32);
        for item in items {
            self.put_byte_array(item.as_ref());
        }
    }

    pub fn put_hashes(&mut self, hashes: &[Hash]) {
        self.put_u32(hashes.len() as u32);
        for hash in hashes {
            self.put_hash(hash);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Longest prefix of `text` that fits a u16 length prefix.
pub fn clamp_short(text: &str) -> &str {
    let mut end = text.len().min(u16::MAX as usize);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads the leading kind byte and checks it.
    pub fn expect_kind(&mut self, kind: u8) -> Result<(), WireError> {
        let found = self.read_u8()?;
        if found != kind {
            return Err(WireError::UnexpectedKind {
                expected: kind,
                found,
            });
        }
        Ok(())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes consumed so far, i.e. the signed prefix when called right before
    /// reading a trailing signature.
    pub fn consumed(&self) -> &'a [u8] {
        &self.data[..self.pos]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::Invalid("bool")),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut out = [0u8; 4];
        out.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(out))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(out))
    }

    pub fn read_token(&mut self) -> Result<Token, WireError> {
        let mut out = [0u8; TOKEN_SIZE];
        out.copy_from_slice(self.take(TOKEN_SIZE)?);
        Ok(Token(out))
    }

    pub fn read_hash(&mut self) -> Result<Hash, WireError> {
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(self.take(HASH_SIZE)?);
        Ok(Hash(out))
    }

    pub fn read_signature(&mut self) -> Result<Signature, WireError> {
        let mut out = [0u8; SIGNATURE_SIZE];
        out.copy_from_slice(self.take(SIGNATURE_SIZE)?);
        Ok(Signature(out))
    }

    /// Reads a trailing signature and verifies it against everything read so
    /// far.
    pub fn read_verified_signature(&mut self, signer: &Token) -> Result<Signature, WireError> {
        let signed = self.consumed();
        let signature = self.read_signature()?;
        if !signer.verify(signed, &signature) {
            return Err(WireError::InvalidSignature);
        }
        Ok(signature)
    }

    pub fn read_byte_array(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_short_byte_array(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn read_array(&mut self) -> Result<Vec<&'a [u8]>, WireError> {
        let count = self.read_u32()? as usize;
        // Every element carries at least its 4-byte length prefix.
        if count > self.remaining() / 4 {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: count * 4,
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_byte_array()?);
        }
        Ok(items)
    }

    pub fn read_hashes(&mut self) -> Result<Vec<Hash>, WireError> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() / HASH_SIZE {
            return Err(WireError::Truncated {
                offset: self.pos,
                needed: count * HASH_SIZE,
            });
        }
        (0..count).map(|_| self.read_hash()).collect()
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Kind byte of an encoded message, if any.
pub fn kind_of(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

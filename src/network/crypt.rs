//! Rolling XOR stream cipher
//!
//! Every byte on an encrypted connection is XORed with `key[cursor]`, after
//! which the cursor advances by one (mod key length). The read and write
//! directions keep independent cursors over the same key, so a session's
//! receive task and send task each own one half and never contend.

use std::sync::Arc;

/// Default key length generated for new sessions.
pub const DEFAULT_KEY_LEN: usize = 4;

/// The key length is announced in a single byte.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher key must not be empty")]
    EmptyKey,

    #[error("cipher key too long: {0} bytes (max {MAX_KEY_LEN})")]
    KeyTooLong(usize),

    #[error("key announcement truncated: declared {declared} bytes, got {available}")]
    TruncatedAnnouncement { declared: usize, available: usize },
}

/// Shared, immutable session key.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey(Arc<[u8]>);

impl CipherKey {
    pub fn new(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.is_empty() {
            return Err(CipherError::EmptyKey);
        }
        if bytes.len() > MAX_KEY_LEN {
            return Err(CipherError::KeyTooLong(bytes.len()));
        }
        Ok(Self(Arc::from(bytes)))
    }

    /// Fresh random key of [`DEFAULT_KEY_LEN`] bytes.
    pub fn generate() -> Self {
        let bytes = rand::random::<u32>().to_be_bytes();
        Self(Arc::from(&bytes[..]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes the key for the plaintext handshake reply.
    ///
    /// Layout: `N, key[0], key[1]^key[0], ..., key[N-1]^key[N-2]`.
    pub fn announcement(&self) -> Vec<u8> {
        let key = self.as_bytes();
        let mut out = Vec::with_capacity(key.len() + 1);
        out.push(key.len() as u8);
        out.push(key[0]);
        for pair in key.windows(2) {
            out.push(pair[1] ^ pair[0]);
        }
        out
    }

    /// Inverse of [`CipherKey::announcement`], as performed by the peer.
    pub fn from_announcement(payload: &[u8]) -> Result<Self, CipherError> {
        let (&declared, rest) = payload.split_first().ok_or(CipherError::EmptyKey)?;
        let declared = declared as usize;
        if declared == 0 {
            return Err(CipherError::EmptyKey);
        }
        if rest.len() < declared {
            return Err(CipherError::TruncatedAnnouncement {
                declared,
                available: rest.len(),
            });
        }

        let mut key = Vec::with_capacity(declared);
        key.push(rest[0]);
        for i in 1..declared {
            let prev = key[i - 1];
            key.push(rest[i] ^ prev);
        }
        Self::new(&key)
    }
}

impl std::fmt::Debug for CipherKey {
    // Keys stay out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKey(len={})", self.0.len())
    }
}

/// One direction of the stream: a key plus a rolling cursor.
#[derive(Debug, Clone)]
pub struct CipherCursor {
    key: CipherKey,
    pos: usize,
}

impl CipherCursor {
    pub fn new(key: CipherKey) -> Self {
        Self { key, pos: 0 }
    }

    /// Transforms one byte and advances the cursor.
    #[inline]
    pub fn apply(&mut self, byte: u8) -> u8 {
        let key = self.key.as_bytes();
        let out = key[self.pos] ^ byte;
        self.pos = (self.pos + 1) % key.len();
        out
    }

    pub fn apply_slice(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.apply(*b);
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }
}

/// Both directions of a connection's cipher.
#[derive(Debug, Clone)]
pub struct CipherStream {
    read: CipherCursor,
    write: CipherCursor,
}

impl CipherStream {
    pub fn new(key: CipherKey) -> Self {
        Self {
            read: CipherCursor::new(key.clone()),
            write: CipherCursor::new(key),
        }
    }

    pub fn encode(&mut self, byte: u8) -> u8 {
        self.write.apply(byte)
    }

    pub fn decode(&mut self, byte: u8) -> u8 {
        self.read.apply(byte)
    }

    pub fn read_cursor(&self) -> usize {
        self.read.position()
    }

    pub fn write_cursor(&self) -> usize {
        self.write.position()
    }

    pub fn key(&self) -> &CipherKey {
        self.read.key()
    }

    /// Splits into `(read, write)` halves for the receive and send tasks.
    pub fn split(self) -> (CipherCursor, CipherCursor) {
        (self.read, self.write)
    }
}

//! Wire framing
//!
//! Before the key exchange a frame is `command, u16 length (BE), payload`.
//! Afterwards every byte goes through the session cipher, "extended" commands
//! carry a four byte length, and command 25 travels wrapped inside command
//! 126 for compatibility with existing clients.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::crypt::{CipherCursor, CipherError, CipherKey, CipherStream};
use super::frame::Frame;

/// Outer command used on the wire for wrapped frames.
pub const WRAPPER_COMMAND: i8 = 126;

/// Logical command that is always sent wrapped once encryption is on.
pub const WRAPPED_COMMAND: i8 = 25;

pub const DEFAULT_HANDSHAKE_COMMAND: i8 = -27;

pub const DEFAULT_EXTENDED_COMMANDS: &[i8] = &[-32, -66, -74, 11, -67, -87, 66];

pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("payload of {len} bytes for command {command} exceeds limit {max}")]
    TooLarge { command: i8, len: usize, max: usize },

    #[error("payload of {len} bytes for command {command} does not fit a 16-bit length")]
    LengthOverflow { command: i8, len: usize },

    #[error("wrapped frame carries no inner command")]
    MissingInnerCommand,
}

impl FrameError {
    /// Peer went away in the middle of a frame.
    pub fn is_truncation(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Protocol parameters shared by every session of a server.
#[derive(Debug, Clone)]
pub struct Protocol {
    handshake_command: i8,
    extended: [bool; 256],
    max_payload: usize,
}

impl Protocol {
    pub fn new(handshake_command: i8, extended_commands: &[i8], max_payload: usize) -> Self {
        let mut extended = [false; 256];
        for &cmd in extended_commands {
            extended[cmd as u8 as usize] = true;
        }
        extended[WRAPPER_COMMAND as u8 as usize] = true;
        Self {
            handshake_command,
            extended,
            max_payload,
        }
    }

    pub fn handshake_command(&self) -> i8 {
        self.handshake_command
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether `command` uses the four byte length field once encrypted.
    pub fn is_extended(&self, command: i8) -> bool {
        self.extended[command as u8 as usize]
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new(
            DEFAULT_HANDSHAKE_COMMAND,
            DEFAULT_EXTENDED_COMMANDS,
            DEFAULT_MAX_PAYLOAD,
        )
    }
}

/// Appends the wire form of `frame` to `out`.
///
/// With `cipher == None` the plaintext layout is used. Size checks run before
/// any byte is transformed, so a rejected frame leaves the cursor untouched.
pub fn encode_frame(
    frame: &Frame,
    cipher: Option<&mut CipherCursor>,
    protocol: &Protocol,
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    let command = frame.command();
    let len = frame.len();
    if len > protocol.max_payload {
        return Err(FrameError::TooLarge {
            command,
            len,
            max: protocol.max_payload,
        });
    }

    let Some(cipher) = cipher else {
        let len16 = u16::try_from(len).map_err(|_| FrameError::LengthOverflow { command, len })?;
        out.reserve(3 + len);
        out.put_i8(command);
        out.put_u16(len16);
        out.put_slice(frame.payload());
        return Ok(());
    };

    let wrapped = command == WRAPPED_COMMAND || command == WRAPPER_COMMAND;
    let (wire_command, size) = if wrapped {
        (WRAPPER_COMMAND, len + 1)
    } else {
        (command, len)
    };
    let extended = protocol.is_extended(wire_command);
    if !extended && size > u16::MAX as usize {
        return Err(FrameError::LengthOverflow { command, len });
    }

    out.reserve(5 + size);
    out.put_u8(cipher.apply(wire_command as u8));
    if extended {
        let size = size as u32;
        // transformed low byte first, written high byte first
        let b4 = cipher.apply(size as u8);
        let b3 = cipher.apply((size >> 8) as u8);
        let b2 = cipher.apply((size >> 16) as u8);
        let b1 = cipher.apply((size >> 24) as u8);
        out.put_slice(&[b1, b2, b3, b4]);
    } else {
        out.put_u8(cipher.apply((size >> 8) as u8));
        out.put_u8(cipher.apply(size as u8));
    }
    if wrapped {
        out.put_u8(cipher.apply(command as u8));
    }
    let start = out.len();
    out.put_slice(frame.payload());
    cipher.apply_slice(&mut out[start..]);
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly on a frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
    cipher: Option<&mut CipherCursor>,
    protocol: &Protocol,
) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }

    let Some(cipher) = cipher else {
        let command = first[0] as i8;
        let len = reader.read_u16().await? as usize;
        check_declared(command, len, protocol.max_payload)?;
        let payload = read_payload(reader, len).await?;
        return Ok(Some(Frame::new(command, payload.freeze())));
    };

    let command = cipher.apply(first[0]) as i8;
    let len = if protocol.is_extended(command) {
        let mut raw = [0u8; 4];
        reader.read_exact(&mut raw).await?;
        let b4 = cipher.apply(raw[3]);
        let b3 = cipher.apply(raw[2]);
        let b2 = cipher.apply(raw[1]);
        let b1 = cipher.apply(raw[0]);
        u32::from_be_bytes([b1, b2, b3, b4]) as usize
    } else {
        let mut raw = [0u8; 2];
        reader.read_exact(&mut raw).await?;
        let hi = cipher.apply(raw[0]);
        let lo = cipher.apply(raw[1]);
        ((hi as usize) << 8) | (lo as usize)
    };

    let max = if command == WRAPPER_COMMAND {
        protocol.max_payload + 1
    } else {
        protocol.max_payload
    };
    check_declared(command, len, max)?;

    let mut payload = read_payload(reader, len).await?;
    cipher.apply_slice(&mut payload);

    if command == WRAPPER_COMMAND {
        if payload.is_empty() {
            return Err(FrameError::MissingInnerCommand);
        }
        let body = payload.split_off(1);
        return Ok(Some(Frame::new(payload[0] as i8, body.freeze())));
    }
    Ok(Some(Frame::new(command, payload.freeze())))
}

fn check_declared(command: i8, len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        return Err(FrameError::TooLarge { command, len, max });
    }
    Ok(())
}

async fn read_payload<R>(reader: &mut R, len: usize) -> io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// The client side of the protocol: sends the handshake trigger, learns the
/// key from the announcement, then encrypts in both directions.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    protocol: Protocol,
    read: Option<CipherCursor>,
    write: Option<CipherCursor>,
}

impl ClientCodec {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            read: None,
            write: None,
        }
    }

    pub fn handshake_frame(&self) -> Frame {
        Frame::empty(self.protocol.handshake_command)
    }

    /// Arms the cipher from the server's plaintext key announcement.
    pub fn accept_announcement(&mut self, frame: &Frame) -> Result<CipherKey, CipherError> {
        let key = CipherKey::from_announcement(frame.payload())?;
        let (read, write) = CipherStream::new(key.clone()).split();
        self.read = Some(read);
        self.write = Some(write);
        Ok(key)
    }

    pub fn is_encrypted(&self) -> bool {
        self.write.is_some()
    }

    pub fn encode(&mut self, frame: &Frame) -> Result<BytesMut, FrameError> {
        let mut out = BytesMut::new();
        encode_frame(frame, self.write.as_mut(), &self.protocol, &mut out)?;
        Ok(out)
    }

    pub async fn read<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        read_frame(reader, self.read.as_mut(), &self.protocol).await
    }
}

//! Length-prefixed Minecraft frame codec.
//!
//! A frame is `VarInt length ∥ length bytes of payload`. VarInts are 1-5
//! bytes, 7 bits of payload each, high bit is continuation. The reader
//! retains every byte it consumes so a sniffed prefix can be forwarded to
//! the backend byte-for-byte.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames with a decoded length at or above this are rejected.
pub const MAX_FRAME_LEN: usize = 1 << 21;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error reading frame")]
    Io(#[source] std::io::Error),

    #[error("malformed VarInt")]
    MalformedVarInt,

    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),

    #[error("stream ended mid-frame")]
    Truncated,
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    }
}

/// A raw frame: decoded length and the payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub length: usize,
    pub payload: Bytes,
}

/// Reads frames from a byte stream while capturing everything consumed.
pub struct FrameReader<R> {
    stream: R,
    captured: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            captured: BytesMut::with_capacity(512),
        }
    }

    /// Read one byte, capturing it.
    pub async fn read_u8(&mut self) -> Result<u8, FrameError> {
        let byte = self.stream.read_u8().await?;
        self.captured.extend_from_slice(&[byte]);
        Ok(byte)
    }

    /// Read a VarInt, capturing the bytes consumed.
    pub async fn read_varint(&mut self) -> Result<i32, FrameError> {
        let first = self.read_u8().await?;
        self.finish_varint(first).await
    }

    /// Continue a VarInt whose first byte was already read (and captured).
    async fn finish_varint(&mut self, first: u8) -> Result<i32, FrameError> {
        let mut value = (first & 0x7f) as i32;
        if first & 0x80 == 0 {
            return Ok(value);
        }
        let mut position = 7;
        for i in 1..5 {
            let byte = self.read_u8().await?;
            if i == 4 && (byte & 0xf0) != 0 {
                return Err(FrameError::MalformedVarInt);
            }
            value |= ((byte & 0x7f) as i32) << position;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            position += 7;
        }
        Err(FrameError::MalformedVarInt)
    }

    /// Read a whole frame: length VarInt, then a contiguous payload.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let first = self.read_u8().await?;
        self.read_frame_continuing(first).await
    }

    /// Read a frame whose length VarInt's first byte was already consumed
    /// (the legacy-ping probe reads one byte before framing starts).
    pub async fn read_frame_continuing(&mut self, first: u8) -> Result<Frame, FrameError> {
        let length = self.finish_varint(first).await?;
        if length < 0 {
            return Err(FrameError::MalformedVarInt);
        }
        let length = length as usize;
        if length >= MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLarge(length));
        }
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        self.captured.extend_from_slice(&payload);
        Ok(Frame {
            length,
            payload: Bytes::from(payload),
        })
    }

    /// Every byte consumed so far, in order.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Take ownership of the captured bytes.
    pub fn take_captured(&mut self) -> Bytes {
        self.captured.split().freeze()
    }
}

/// Encode a VarInt into the buffer.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut val = value as u32;
    loop {
        let mut byte = (val & 0x7f) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

/// Encode a length-prefixed UTF-8 string into the buffer.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Decode a VarInt from a byte slice, returning `(value, bytes_consumed)`.
pub fn decode_varint(buf: &[u8]) -> Result<(i32, usize), FrameError> {
    let mut value: i32 = 0;
    let mut position = 0;
    for (i, &byte) in buf.iter().take(5).enumerate() {
        if i == 4 && (byte & 0xf0) != 0 {
            return Err(FrameError::MalformedVarInt);
        }
        value |= ((byte & 0x7f) as i32) << position;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        position += 7;
    }
    if buf.len() >= 5 {
        Err(FrameError::MalformedVarInt)
    } else {
        Err(FrameError::Truncated)
    }
}

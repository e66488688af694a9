//! Frame Codec
//!
//! Frames are `magic(2) | version(1) | kind(1) | length(4, BE) | payload`.
//! Reads are buffered in a `BytesMut` so `read_message` can be cancelled by
//! a `select!` without losing a partially received frame.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::*;
use super::types::Message;
use crate::error::ProtocolError;

/// Append one encoded frame for `message` to `dst`
pub fn encode_frame(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = message.encode_payload()?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u16(FRAME_MAGIC);
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_u8(message.kind());
    dst.put_u32(len);
    dst.extend_from_slice(&payload);
    Ok(())
}

/// Reads framed messages from the read half of a connection
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_length: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_length(inner, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(inner: R, max_frame_length: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_frame_length,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame
    /// boundary. A close in the middle of a frame is `TruncatedFrame`.
    pub async fn read_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(Some(message));
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::TruncatedFrame);
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buf[..FRAME_HEADER_LEN];
        let magic = header.get_u16();
        let version = header.get_u8();
        let kind = header.get_u8();
        let len = header.get_u32() as usize;

        if magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        if len > self.max_frame_length {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        if self.buf.len() < FRAME_HEADER_LEN + len {
            self.buf.reserve(FRAME_HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len);
        Message::decode(kind, &payload).map(Some)
    }
}

/// Writes framed messages to the write half of a connection
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Encode and flush a single message
    pub async fn write_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        self.buf.clear();
        encode_frame(message, &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Underlying stream, for writes that bypass framing
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Shut down the write direction of the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

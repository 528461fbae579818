//! Codec for encoding/decoding coordinator frames
//!
//! Every frame is `[length: u32 big-endian][payload: bincode]`.

use crate::messages::Handshake;
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unsupported protocol version {0}, expected {PROTOCOL_VERSION}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-framed bincode codec for a single message type
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_frame_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Limit accepted and produced payloads; clamped to [`MAX_FRAME_SIZE`]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
            _marker: PhantomData,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_frame_size(self.max_frame_size)
    }
}

impl<T: Serialize> FrameCodec<T> {
    /// Encode a message to a complete frame
    pub fn encode_frame(&self, msg: &T) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }
}

impl<T: DeserializeOwned> FrameCodec<T> {
    /// Decode one message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was consumed,
    /// Ok(None) if more data is needed,
    /// Err on an oversized or undecodable frame
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let msg_bytes = buf.split_to(length);

        Ok(Some(bincode::deserialize(&msg_bytes)?))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.encode_frame(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)
    }
}

/// Read the handshake frame that opens a raw connection.
///
/// The payload is `(protocol version, handshake)`. Reads exactly one frame so
/// the rest of the stream can be handed on untouched.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake, CodecError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await? as usize;
    // A handshake is a few dozen bytes; anything large is garbage.
    if length > 1024 {
        return Err(CodecError::MessageTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let (version, handshake): (u32, Handshake) = bincode::deserialize(&payload)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(handshake)
}

/// Write the handshake frame that opens a raw connection
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame =
        FrameCodec::<(u32, &Handshake)>::new().encode_frame(&(PROTOCOL_VERSION, handshake))?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

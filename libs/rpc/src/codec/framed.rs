//! Message codec over a framed transport.
//!
//! Every message is two frames: the [`Header`] encoded with the connection's
//! codec, then the body bytes as-is. Bodies are encoded and decoded by the
//! caller, so reading a body never depends on who asked for it.

use crate::codec::{CodecType, Header};
use crate::error::Result;
use crate::transport::{FrameRead, FrameWrite, Transport};

/// Reading side of a message codec
#[async_trait::async_trait]
pub trait CodecRead: Send {
    /// Read the next message header
    async fn read_header(&mut self) -> Result<Header>;

    /// Read the body that follows the last header
    async fn read_body(&mut self) -> Result<Vec<u8>>;

    /// Consume the body that follows the last header without keeping it.
    ///
    /// Must consume exactly what `read_body` would have, or the next header
    /// is read from the middle of a body.
    async fn discard_body(&mut self) -> Result<()> {
        self.read_body().await.map(drop)
    }
}

/// Writing side of a message codec
#[async_trait::async_trait]
pub trait CodecWrite: Send {
    /// Write a header followed by its body
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Close the underlying connection for writing
    async fn close(&mut self) -> Result<()>;
}

pub struct FramedCodecReader<R> {
    frames: R,
    codec: CodecType,
}

impl<R: FrameRead> FramedCodecReader<R> {
    pub fn new(frames: R, codec: CodecType) -> Self {
        Self { frames, codec }
    }
}

#[async_trait::async_trait]
impl<R: FrameRead> CodecRead for FramedCodecReader<R> {
    async fn read_header(&mut self) -> Result<Header> {
        let bytes = self.frames.receive().await?;
        self.codec.decode(&bytes)
    }

    async fn read_body(&mut self) -> Result<Vec<u8>> {
        self.frames.receive().await
    }
}

pub struct FramedCodecWriter<W> {
    frames: W,
    codec: CodecType,
}

impl<W: FrameWrite> FramedCodecWriter<W> {
    pub fn new(frames: W, codec: CodecType) -> Self {
        Self { frames, codec }
    }
}

#[async_trait::async_trait]
impl<W: FrameWrite> CodecWrite for FramedCodecWriter<W> {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.codec.encode(header)?;
        self.frames.send(&header).await?;
        self.frames.send(body).await
    }

    async fn close(&mut self) -> Result<()> {
        self.frames.close().await
    }
}

/// Split a transport into a codec reader and writer sharing one codec
pub fn framed<T: Transport>(
    transport: T,
    codec: CodecType,
) -> (FramedCodecReader<T::Reader>, FramedCodecWriter<T::Writer>) {
    let (reader, writer) = transport.into_split();
    (
        FramedCodecReader::new(reader, codec),
        FramedCodecWriter::new(writer, codec),
    )
}

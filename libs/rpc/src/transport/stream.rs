use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::error::{Error, Result};
use crate::transport::{FrameRead, FrameWrite, Transport};

/// Largest frame accepted from the peer (100 MiB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Reads frames sent with a 4-byte big-endian length prefix
pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

fn closed_on_eof(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        err.into()
    }
}

#[async_trait::async_trait]
impl<R> FrameRead for FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Vec<u8>> {
        let len = self.inner.read_u32().await.map_err(closed_on_eof)? as usize;

        if len > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(closed_on_eof)?;

        Ok(buf)
    }
}

/// Writes frames with a 4-byte big-endian length prefix
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<W> FrameWrite for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                bytes.len()
            )));
        }

        self.inner.write_u32(bytes.len() as u32).await?;
        self.inner.write_all(bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Transport over any in-process duplex stream, e.g. [`tokio::io::duplex`]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = FrameReader<ReadHalf<S>>;
    type Writer = FrameWriter<WriteHalf<S>>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (reader, writer) = tokio::io::split(self.stream);
        (FrameReader::new(reader), FrameWriter::new(writer))
    }
}

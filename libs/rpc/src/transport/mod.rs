use crate::error::Result;

pub mod stream;
pub mod tcp;
pub mod unix;

pub use self::stream::{FrameReader, FrameWriter, StreamTransport, MAX_FRAME_LEN};
pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};
pub use self::unix::{UnixTransport, UnixTransportBuilder, UnixTransportListener};

/// Receiving half of a connection, yielding one length-prefixed frame at a time
#[async_trait::async_trait]
pub trait FrameRead: Send {
    /// Receive the next frame
    async fn receive(&mut self) -> Result<Vec<u8>>;
}

/// Sending half of a connection
#[async_trait::async_trait]
pub trait FrameWrite: Send {
    /// Send one frame
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Shut down the sending side of the connection
    async fn close(&mut self) -> Result<()>;
}

/// An open duplex connection.
///
/// The client reads and writes from different tasks, so a transport is
/// consumed by splitting it into independently owned halves.
pub trait Transport: Send {
    type Reader: FrameRead + 'static;
    type Writer: FrameWrite + 'static;

    /// Split the connection into its reading and writing halves
    fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// Accepts incoming connections
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport;

    /// Accept the next connection
    async fn accept(&self) -> Result<Self::Transport>;

    /// Stop listening
    async fn close(&mut self) -> Result<()>;
}

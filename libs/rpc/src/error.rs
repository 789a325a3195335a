use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the RPC client.
///
/// Errors are `Clone` so that a single connection failure can be handed to
/// every call that was still waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The client is closing or the connection has failed.
    #[error("connection has been shut down")]
    Shutdown,

    /// The server reported a failure for this call.
    #[error("{0}")]
    Remote(String),

    /// The response body could not be turned into the reply value.
    #[error("reading body {0}")]
    Decode(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("{0}")]
    Custom(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

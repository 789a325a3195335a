//! Wire header and the codecs a connection can negotiate.

use bincode::Options as _;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::MAX_FRAME_LEN;

pub mod framed;

pub use self::framed::{framed, CodecRead, CodecWrite, FramedCodecReader, FramedCodecWriter};

/// Per-message header correlating a request with its response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub service: String,
    pub method: String,
    /// Sequence number chosen by the client; 0 never names a call
    pub seq: u64,
    /// Empty on success, otherwise the error reported by the server
    pub error: String,
}

/// Codec selected for a connection during option negotiation.
///
/// Encodes headers as well as call arguments and replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    #[default]
    Bincode,
    Json,
}

/// Bincode settings shared by both ends. Decoding never claims more memory
/// than one frame can carry, whatever length prefixes the peer sends.
fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

impl CodecType {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Bincode => bincode_options()
                .serialize(value)
                .map_err(|e| Error::Codec(e.to_string())),
            Self::Json => serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Bincode => bincode_options()
                .deserialize(bytes)
                .map_err(|e| Error::Codec(e.to_string())),
            Self::Json => serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string())),
        }
    }
}

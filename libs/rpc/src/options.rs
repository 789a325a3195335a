use serde::{Deserialize, Serialize};

use crate::codec::CodecType;
use crate::error::{Error, Result};
use crate::transport::{FrameRead, FrameWrite};

/// Protocol identification constant sent at the start of every connection
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Per-connection parameters negotiated before any call is made.
///
/// The client sends these once, as a single JSON frame, right after the
/// connection opens. Everything after that frame uses `codec_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: CodecType,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
        }
    }
}

impl Options {
    pub fn with_codec(codec_type: CodecType) -> Self {
        Self {
            codec_type,
            ..Self::default()
        }
    }

    /// Resolve caller-supplied options into the ones used on the wire.
    ///
    /// The magic number is not caller-configurable and is always reset.
    pub fn resolve(options: Option<Options>) -> Options {
        match options {
            Some(options) => Options {
                magic_number: MAGIC_NUMBER,
                ..options
            },
            None => Options::default(),
        }
    }

    /// Send the options as the opening frame of a connection
    pub async fn send<W>(&self, writer: &mut W) -> Result<()>
    where
        W: FrameWrite + ?Sized,
    {
        let bytes =
            serde_json::to_vec(self).map_err(|e| Error::InvalidOptions(e.to_string()))?;
        writer.send(&bytes).await
    }

    /// Read the opening frame of a connection, rejecting foreign protocols
    pub async fn receive<R>(reader: &mut R) -> Result<Options>
    where
        R: FrameRead + ?Sized,
    {
        let bytes = reader.receive().await?;
        let options: Options =
            serde_json::from_slice(&bytes).map_err(|e| Error::InvalidOptions(e.to_string()))?;

        if options.magic_number != MAGIC_NUMBER {
            return Err(Error::InvalidOptions(format!(
                "invalid magic number {:#x}",
                options.magic_number
            )));
        }
        Ok(options)
    }
}

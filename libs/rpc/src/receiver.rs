//! Background task reading responses for one client.
//!
//! There is exactly one receiver per connection and it is the only reader
//! of the codec, so reads need no lock.

use std::sync::Arc;

use crate::client::Inner;
use crate::codec::{CodecRead, Header};
use crate::error::{Error, Result};
use crate::registry::{Outcome, Registry};

/// Read responses until the connection fails or the client is closed, then
/// fail whatever is still pending.
pub(crate) async fn run(inner: Arc<Inner>, mut reader: Box<dyn CodecRead>) {
    tracing::debug!("rpc client receiver started");

    let err = loop {
        let header = tokio::select! {
            _ = inner.closed.cancelled() => break Error::ConnectionClosed,
            header = reader.read_header() => match header {
                Ok(header) => header,
                Err(err) => break err,
            },
        };

        if let Err(err) = dispatch(&inner.registry, reader.as_mut(), header).await {
            break err;
        }
    };

    drop(reader);
    tracing::debug!(error = %err, "rpc client receiver stopped");
    inner.terminate_all(err).await;
}

/// Match one response to its call. Errors returned here are fatal to the
/// connection; per-call failures go to the call instead.
async fn dispatch(registry: &Registry, reader: &mut dyn CodecRead, header: Header) -> Result<()> {
    let seq = header.seq;

    let Some(call) = registry.remove(seq) else {
        // Usually a call whose send failed; the body must still be consumed
        tracing::warn!(seq, "discarding response with no pending call");
        return reader.discard_body().await;
    };

    if !header.error.is_empty() {
        tracing::debug!(seq, error = %header.error, "server reported an error");
        let discarded = reader.discard_body().await;
        call.complete(Outcome::Failed(Error::Remote(header.error))).await;
        return discarded;
    }

    match reader.read_body().await {
        Ok(body) => {
            tracing::debug!(seq, len = body.len(), "received response");
            call.complete(Outcome::Body(body)).await;
            Ok(())
        }
        Err(err) => {
            call.complete(Outcome::Failed(Error::Decode(err.to_string()))).await;
            Err(err)
        }
    }
}

//! Background task writing requests for one client.
//!
//! Callers only register and enqueue. This task is the single writer of the
//! codec, so a request is either written whole or the connection is being
//! torn down; a caller giving up on its call never cuts a frame short.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::Inner;
use crate::codec::{CodecWrite, Header};
use crate::error::Result;
use crate::registry::Outcome;

/// A registered call waiting to be written
pub(crate) struct Request {
    pub(crate) seq: u64,
    pub(crate) service: String,
    pub(crate) method: String,
    /// Encoded arguments, or why they could not be encoded
    pub(crate) body: Result<Vec<u8>>,
}

/// Write queued requests in order until the client is closed, then shut the
/// connection down for writing.
///
/// A write still in progress at close is abandoned. The calls it carried are
/// failed by the receiver along with everything else pending.
pub(crate) async fn run(
    inner: Arc<Inner>,
    mut writer: Box<dyn CodecWrite>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) -> Result<()> {
    tracing::debug!("rpc client sender started");
    let mut header = Header::default();

    loop {
        let request = tokio::select! {
            _ = inner.closed.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let Request {
            seq,
            service,
            method,
            body,
        } = request;

        header.service.clear();
        header.service.push_str(&service);
        header.method.clear();
        header.method.push_str(&method);
        header.seq = seq;
        header.error.clear();

        let written = match body {
            Ok(body) => tokio::select! {
                _ = inner.closed.cancelled() => break,
                written = writer.write(&header, &body) => written,
            },
            Err(err) => Err(err),
        };

        match written {
            Ok(()) => tracing::debug!(seq, %service, %method, "sent request"),
            Err(err) => {
                tracing::warn!(seq, %service, %method, error = %err, "failed to send request");
                // The receiver may already have answered this call
                if let Some(call) = inner.registry.remove(seq) {
                    call.complete(Outcome::Failed(err)).await;
                }
            }
        }
    }

    tracing::debug!("rpc client sender stopped");
    writer.close().await
}

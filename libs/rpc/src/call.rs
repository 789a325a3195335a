use serde::Deserialize;
use tokio::sync::mpsc;

use crate::codec::CodecType;
use crate::error::{Error, Result};
use crate::registry::{Outcome, PendingCall};

/// Capacity of the completion queue allocated when the caller supplies none
pub const DEFAULT_DONE_CAPACITY: usize = 10;

/// One RPC invocation, handed back through its completion queue once its
/// outcome is known.
#[derive(Debug)]
pub struct Call<R> {
    /// Sequence number on this connection; 0 if the call was never registered
    pub seq: u64,
    pub service: String,
    pub method: String,
    /// Decoded response, set on success
    pub reply: Option<R>,
    /// Local or remote failure, set otherwise
    pub error: Option<Error>,
}

impl<R> Call<R> {
    pub(crate) fn new(service: &str, method: &str) -> Self {
        Self {
            seq: 0,
            service: service.to_string(),
            method: method.to_string(),
            reply: None,
            error: None,
        }
    }

    /// Turn the finished call into its reply or its error
    pub fn into_result(self) -> Result<R> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.reply
            .ok_or_else(|| Error::Custom(format!("call {} completed without a reply", self.seq)))
    }
}

/// Sending side of a completion queue. Cloning it lets several calls share
/// one queue.
pub struct CallSender<R> {
    tx: mpsc::Sender<Call<R>>,
}

impl<R> Clone for CallSender<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send> CallSender<R> {
    /// Deliver a finished call. Waits while the queue is full.
    pub(crate) async fn deliver(&self, call: Call<R>) {
        let seq = call.seq;
        if self.tx.send(call).await.is_err() {
            tracing::debug!(seq, "completion queue dropped, call was abandoned");
        }
    }
}

/// Receiving side of a completion queue
pub struct CallReceiver<R> {
    rx: mpsc::Receiver<Call<R>>,
}

impl<R> CallReceiver<R> {
    /// Wait for the next finished call.
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Call<R>> {
        self.rx.recv().await
    }
}

/// Create a completion queue holding up to `capacity` finished calls.
///
/// # Panics
///
/// Panics if `capacity` is zero: the receiver task delivers into this queue
/// and an unbuffered queue nobody is reading yet would stall it.
pub fn call_channel<R>(capacity: usize) -> (CallSender<R>, CallReceiver<R>) {
    assert!(capacity > 0, "rpc client: done channel is unbuffered");
    let (tx, rx) = mpsc::channel(capacity);
    (CallSender { tx }, CallReceiver { rx })
}

/// Result of submitting a call with [`Client::go`](crate::Client::go)
pub struct Submission<R> {
    seq: u64,
    done: Option<CallReceiver<R>>,
}

impl<R> Submission<R> {
    pub(crate) fn new(seq: u64, done: Option<CallReceiver<R>>) -> Self {
        Self { seq, done }
    }

    /// Sequence number assigned to the call, or 0 if the client was unavailable
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_registered(&self) -> bool {
        self.seq != 0
    }

    /// The queue allocated by `go`; `None` if the caller supplied its own
    pub fn into_receiver(self) -> Option<CallReceiver<R>> {
        self.done
    }

    /// Wait for the call on the queue allocated by `go`
    pub async fn wait(self) -> Option<Call<R>> {
        match self.done {
            Some(mut done) => done.recv().await,
            None => None,
        }
    }
}

/// A call parked in the registry together with everything needed to finish it
pub(crate) struct Inflight<R> {
    call: Call<R>,
    codec: CodecType,
    done: CallSender<R>,
}

impl<R> Inflight<R> {
    pub(crate) fn new(call: Call<R>, codec: CodecType, done: CallSender<R>) -> Self {
        Self { call, codec, done }
    }
}

#[async_trait::async_trait]
impl<R> PendingCall for Inflight<R>
where
    R: for<'de> Deserialize<'de> + Send + 'static,
{
    fn assign(&mut self, seq: u64) {
        self.call.seq = seq;
    }

    async fn complete(self: Box<Self>, outcome: Outcome) {
        let Inflight {
            mut call,
            codec,
            done,
        } = *self;

        match outcome {
            Outcome::Body(bytes) => match codec.decode::<R>(&bytes) {
                Ok(reply) => call.reply = Some(reply),
                Err(err) => call.error = Some(Error::Decode(err.to_string())),
            },
            Outcome::Failed(err) => call.error = Some(err),
        }

        done.deliver(call).await;
    }
}

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::call::{call_channel, Call, CallSender, Inflight, Submission, DEFAULT_DONE_CAPACITY};
use crate::codec::{CodecRead, CodecType, CodecWrite, FramedCodecReader, FramedCodecWriter};
use crate::error::{Error, Result};
use crate::options::Options;
use crate::receiver;
use crate::registry::{Outcome, PendingCall, Registry};
use crate::sender::{self, Request};
use crate::transport::{TcpTransport, Transport, UnixTransport};

pub(crate) struct Inner {
    pub(crate) registry: Registry,
    /// Send lock: registering a call and queueing its request happen
    /// together, so requests are written in sequence order and nothing is
    /// queued once the registry has been drained
    sending: Mutex<mpsc::UnboundedSender<Request>>,
    /// Taken by `close` to wait for the write half to be shut down
    sender_task: Mutex<Option<JoinHandle<Result<()>>>>,
    options: Options,
    /// Cancelled by `close` to stop both background tasks
    pub(crate) closed: CancellationToken,
}

impl Inner {
    /// Fail every pending call with `err` and refuse new ones
    pub(crate) async fn terminate_all(&self, err: Error) {
        let calls = {
            let _sending = self.sending.lock();
            self.registry.shut_down()
        };

        tracing::debug!(pending = calls.len(), error = %err, "terminating pending calls");
        for call in calls {
            call.complete(Outcome::Failed(err.clone())).await;
        }
    }
}

/// RPC client multiplexing concurrent calls over one connection.
///
/// Cloning is cheap; all clones share the connection. Two background tasks
/// serve it: one writes requests in order, the other reads responses until
/// the connection fails or the client is closed. Dropping the last clone
/// stops both and releases the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    _stop_tasks: Arc<DropGuard>,
}

impl Client {
    /// Start a client on an open connection.
    ///
    /// Sends `options` as the opening frame, then starts the background
    /// tasks. Must be called from within a Tokio runtime.
    pub async fn new<T: Transport>(transport: T, options: Options) -> Result<Self> {
        let (reader, mut writer) = transport.into_split();

        if let Err(err) = options.send(&mut writer).await {
            tracing::warn!(error = %err, "rpc client: options error");
            return Err(err);
        }

        let codec = options.codec_type;
        Ok(Self::with_codec(
            FramedCodecReader::new(reader, codec),
            FramedCodecWriter::new(writer, codec),
            options,
        ))
    }

    /// Start a client on an already negotiated codec pair
    pub fn with_codec(
        reader: impl CodecRead + 'static,
        writer: impl CodecWrite + 'static,
        options: Options,
    ) -> Self {
        let closed = CancellationToken::new();
        let (requests, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: Registry::new(),
            sending: Mutex::new(requests),
            sender_task: Mutex::new(None),
            options,
            closed: closed.clone(),
        });

        let writing = tokio::spawn(
            sender::run(inner.clone(), Box::new(writer), queue).in_current_span(),
        );
        *inner.sender_task.lock() = Some(writing);
        tokio::spawn(receiver::run(inner.clone(), Box::new(reader)).in_current_span());

        Self {
            inner,
            _stop_tasks: Arc::new(closed.drop_guard()),
        }
    }

    /// Connect to a TCP server.
    ///
    /// The connection is dropped again if the option handshake fails.
    pub async fn dial_tcp(addr: SocketAddr, options: Option<Options>) -> Result<Self> {
        let options = Options::resolve(options);
        let transport = TcpTransport::connect(addr).await?;
        Self::new(transport, options).await
    }

    /// Connect to a server listening on a Unix socket
    pub async fn dial_unix(path: impl AsRef<Path>, options: Option<Options>) -> Result<Self> {
        let options = Options::resolve(options);
        let transport = UnixTransport::connect(path).await?;
        Self::new(transport, options).await
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether new calls can still be made
    pub fn is_available(&self) -> bool {
        self.inner.registry.is_available()
    }

    /// Close the connection.
    ///
    /// Interrupts any write in progress, even one stalled on a peer that
    /// stopped reading. Calls still pending fail with
    /// [`Error::ConnectionClosed`]. Closing a second time returns
    /// [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        self.inner.registry.mark_closing()?;
        tracing::debug!("closing rpc client");

        self.inner.closed.cancel();
        let writing = self.inner.sender_task.lock().take();
        match writing {
            Some(writing) => writing.await.map_err(|e| Error::Custom(e.to_string()))?,
            None => Ok(()),
        }
    }

    /// Submit a call without waiting for its reply.
    ///
    /// The finished [`Call`] is delivered to `done`, or to a queue of
    /// [`DEFAULT_DONE_CAPACITY`] allocated here and returned in the
    /// [`Submission`]. A call made on an unavailable client is still
    /// delivered, with [`Error::Shutdown`].
    ///
    /// # Cancel safety
    ///
    /// The call is registered and queued for writing before the first await
    /// point; dropping this future does not affect the connection. Only the
    /// notification of a call rejected up front can be lost that way.
    pub async fn go<A, R>(
        &self,
        service: &str,
        method: &str,
        args: &A,
        done: Option<CallSender<R>>,
    ) -> Submission<R>
    where
        A: Serialize + Sync,
        R: for<'de> Deserialize<'de> + Send + 'static,
    {
        let (done, receiver) = match done {
            Some(done) => (done, None),
            None => {
                let (done, receiver) = call_channel(DEFAULT_DONE_CAPACITY);
                (done, Some(receiver))
            }
        };

        let codec = self.codec();
        let body = codec.encode(args);
        let call = Inflight::new(Call::new(service, method), codec, done);

        let seq = self.send(Box::new(call), service, method, body).await;
        Submission::new(seq, receiver)
    }

    /// Call `service.method` and wait for the reply
    pub async fn call<A, R>(&self, service: &str, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync,
        R: for<'de> Deserialize<'de> + Send + 'static,
    {
        let (done, mut receiver) = call_channel(1);
        self.go(service, method, args, Some(done)).await;

        match receiver.recv().await {
            Some(call) => call.into_result(),
            None => Err(Error::Shutdown),
        }
    }

    fn codec(&self) -> CodecType {
        self.inner.options.codec_type
    }

    /// Register the call and queue it for the sender task.
    ///
    /// Returns the assigned sequence number, or 0 if the call was rejected.
    async fn send(
        &self,
        call: Box<dyn PendingCall>,
        service: &str,
        method: &str,
        body: Result<Vec<u8>>,
    ) -> u64 {
        let queued = {
            let requests = self.inner.sending.lock();
            self.inner.registry.register(call).map(|seq| {
                let request = Request {
                    seq,
                    service: service.to_string(),
                    method: method.to_string(),
                    body,
                };
                (seq, requests.send(request).is_ok())
            })
        };

        match queued {
            Ok((seq, true)) => seq,
            Ok((seq, false)) => {
                tracing::warn!(seq, %service, %method, "rpc client sender is gone");
                if let Some(call) = self.inner.registry.remove(seq) {
                    call.complete(Outcome::Failed(Error::ConnectionClosed)).await;
                }
                seq
            }
            Err(call) => {
                call.complete(Outcome::Failed(Error::Shutdown)).await;
                0
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::codec::Header;

    enum Scripted {
        Response(Header, Vec<u8>),
        Fail(Error),
    }

    /// Reader fed from a script; ends the connection when the script is dropped
    struct ScriptedReader {
        script: mpsc::UnboundedReceiver<Scripted>,
        body: Option<Vec<u8>>,
        discarded: Arc<AtomicUsize>,
        /// Counts calls to `read_header`
        headers_read: watch::Sender<usize>,
    }

    impl ScriptedReader {
        fn new(script: mpsc::UnboundedReceiver<Scripted>) -> Self {
            let (headers_read, _) = watch::channel(0);
            Self {
                script,
                body: None,
                discarded: Arc::new(AtomicUsize::new(0)),
                headers_read,
            }
        }
    }

    #[async_trait::async_trait]
    impl CodecRead for ScriptedReader {
        async fn read_header(&mut self) -> Result<Header> {
            self.headers_read.send_modify(|count| *count += 1);
            match self.script.recv().await {
                Some(Scripted::Response(header, body)) => {
                    self.body = Some(body);
                    Ok(header)
                }
                Some(Scripted::Fail(err)) => Err(err),
                None => Err(Error::ConnectionClosed),
            }
        }

        async fn read_body(&mut self) -> Result<Vec<u8>> {
            self.body
                .take()
                .ok_or_else(|| Error::InvalidFrame("no body".to_string()))
        }

        async fn discard_body(&mut self) -> Result<()> {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            self.read_body().await.map(drop)
        }
    }

    /// Writer recording every header it is asked to write
    struct RecordingWriter {
        written: Arc<Mutex<Vec<Header>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl CodecWrite for RecordingWriter {
        async fn write(&mut self, header: &Header, _body: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            }
            self.written.lock().push(header.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Writer that lets the receiver answer a request before failing to
    /// write it
    struct AnsweredThenFailing {
        script: mpsc::UnboundedSender<Scripted>,
        headers_read: watch::Receiver<usize>,
    }

    #[async_trait::async_trait]
    impl CodecWrite for AnsweredThenFailing {
        async fn write(&mut self, header: &Header, _body: &[u8]) -> Result<()> {
            let _ = self
                .script
                .send(Scripted::Response(header.clone(), b"5".to_vec()));
            // The receiver only asks for a second header once it has
            // completed the call answered by the first
            let _ = self.headers_read.wait_for(|count| *count >= 2).await;
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        client: Client,
        script: mpsc::UnboundedSender<Scripted>,
        written: Arc<Mutex<Vec<Header>>>,
        fail_writes: Arc<AtomicBool>,
        discarded: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            let (script, rx) = mpsc::unbounded_channel();
            let written = Arc::new(Mutex::new(Vec::new()));
            let fail_writes = Arc::new(AtomicBool::new(false));
            let reader = ScriptedReader::new(rx);
            let discarded = reader.discarded.clone();

            let client = Client::with_codec(
                reader,
                RecordingWriter {
                    written: written.clone(),
                    fail: fail_writes.clone(),
                },
                Options::with_codec(CodecType::Json),
            );

            Self {
                client,
                script,
                written,
                fail_writes,
                discarded,
            }
        }

        fn respond(&self, seq: u64, error: &str, body: &[u8]) {
            let header = Header {
                service: "Arith".to_string(),
                method: "Add".to_string(),
                seq,
                error: error.to_string(),
            };
            let _ = self.script.send(Scripted::Response(header, body.to_vec()));
        }

        /// Wait for the sender task to have written `count` requests
        async fn written_seqs(&self, count: usize) -> Vec<u64> {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let seqs: Vec<u64> = self.written.lock().iter().map(|h| h.seq).collect();
                    if seqs.len() >= count {
                        return seqs;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("requests were not written")
        }
    }

    #[tokio::test]
    async fn reply_is_decoded_into_the_call() {
        let harness = Harness::new();

        let submission = harness
            .client
            .go::<_, i32>("Arith", "Add", &(2, 3), None)
            .await;
        assert_eq!(submission.seq(), 1);

        harness.respond(1, "", b"5");
        let mut done = submission.into_receiver().unwrap();
        let call = done.recv().await.unwrap();

        assert_eq!(call.service, "Arith");
        assert_eq!(call.into_result().unwrap(), 5);
        assert!(done.recv().await.is_none());
        assert_eq!(harness.client.pending(), 0);
    }

    #[tokio::test]
    async fn concurrent_submissions_get_distinct_sequences_in_write_order() {
        let harness = Harness::new();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let client = harness.client.clone();
                tokio::spawn(async move {
                    client
                        .go::<_, i32>("Arith", "Add", &(i, i), None)
                        .await
                        .seq()
                })
            })
            .collect();

        let mut seqs = Vec::new();
        for task in tasks {
            seqs.push(task.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=32).collect::<Vec<u64>>());

        let written = harness.written_seqs(32).await;
        assert_eq!(written, (1..=32).collect::<Vec<u64>>());
        assert_eq!(harness.client.pending(), 32);
    }

    #[tokio::test]
    async fn remote_error_is_delivered_once_and_body_discarded() {
        let harness = Harness::new();
        let submission = harness
            .client
            .go::<_, i32>("Arith", "Div", &(1, 0), None)
            .await;

        harness.respond(1, "divide by zero", b"0");
        let mut done = submission.into_receiver().unwrap();
        let call = done.recv().await.unwrap();

        match call.error {
            Some(Error::Remote(msg)) => assert_eq!(msg, "divide by zero"),
            ref other => panic!("expected remote error, got {:?}", other),
        }
        assert!(call.reply.is_none());
        assert!(done.recv().await.is_none());
        assert_eq!(harness.discarded.load(Ordering::SeqCst), 1);
        assert!(harness.client.is_available());
    }

    #[tokio::test]
    async fn decode_failure_leaves_the_connection_usable() {
        let harness = Harness::new();

        let first = harness
            .client
            .go::<_, i32>("Arith", "Add", &(2, 3), None)
            .await;
        harness.respond(1, "", b"\"not a number\"");
        let mut done = first.into_receiver().unwrap();
        assert!(matches!(
            done.recv().await.unwrap().error,
            Some(Error::Decode(_))
        ));
        assert!(done.recv().await.is_none());

        let second = harness
            .client
            .go::<_, i32>("Arith", "Add", &(4, 4), None)
            .await;
        harness.respond(2, "", b"8");
        assert_eq!(second.wait().await.unwrap().into_result().unwrap(), 8);
        assert!(harness.client.is_available());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn send_failure_completes_only_that_call() {
        let harness = Harness::new();
        let healthy = harness
            .client
            .go::<_, i32>("Arith", "Add", &(1, 1), None)
            .await;
        harness.written_seqs(1).await;

        harness.fail_writes.store(true, Ordering::SeqCst);
        let failed = harness
            .client
            .go::<_, i32>("Arith", "Add", &(2, 2), None)
            .await;
        assert_eq!(failed.seq(), 2);

        let mut done = failed.into_receiver().unwrap();
        assert!(matches!(done.recv().await.unwrap().error, Some(Error::Io(_))));
        assert!(done.recv().await.is_none());
        assert!(logs_contain("failed to send request"));

        // The connection itself is untouched
        assert!(harness.client.is_available());
        assert_eq!(harness.client.pending(), 1);
        harness.respond(1, "", b"2");
        assert_eq!(healthy.wait().await.unwrap().into_result().unwrap(), 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn send_failure_after_the_reply_leaves_the_reply_in_place() {
        let (script, rx) = mpsc::unbounded_channel();
        let reader = ScriptedReader::new(rx);
        let writer = AnsweredThenFailing {
            script,
            headers_read: reader.headers_read.subscribe(),
        };
        let client = Client::with_codec(reader, writer, Options::with_codec(CodecType::Json));

        let submission = client.go::<_, i32>("Arith", "Add", &(2, 3), None).await;
        let mut done = submission.into_receiver().unwrap();

        let call = done.recv().await.unwrap();
        assert_eq!(call.seq, 1);
        assert_eq!(call.into_result().unwrap(), 5);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !logs_contain("failed to send request") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("send failure was never reported");

        // The failed write found nothing left to complete
        assert!(done.recv().await.is_none());
        assert_eq!(client.pending(), 0);
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn response_without_pending_call_is_discarded() {
        let harness = Harness::new();
        let submission = harness
            .client
            .go::<_, i32>("Arith", "Add", &(2, 3), None)
            .await;

        harness.respond(99, "", b"1234");
        harness.respond(1, "", b"5");

        assert_eq!(submission.wait().await.unwrap().into_result().unwrap(), 5);
        assert_eq!(harness.discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_failure_terminates_every_pending_call() {
        let harness = Harness::new();
        let (done, mut receiver) = call_channel::<i32>(4);

        for i in 0..3 {
            harness
                .client
                .go("Arith", "Add", &(i, i), Some(done.clone()))
                .await;
        }
        drop(done);

        let _ = harness.script.send(Scripted::Fail(Error::ConnectionClosed));

        let mut seqs = Vec::new();
        while let Some(call) = receiver.recv().await {
            assert!(matches!(call.error, Some(Error::ConnectionClosed)));
            seqs.push(call.seq);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert_eq!(harness.client.pending(), 0);
        assert!(!harness.client.is_available());

        let rejected = harness
            .client
            .go::<_, i32>("Arith", "Add", &(1, 1), None)
            .await;
        assert!(!rejected.is_registered());
        assert!(matches!(
            rejected.wait().await.unwrap().error,
            Some(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn close_rejects_new_calls_and_second_close() {
        let harness = Harness::new();

        harness.client.close().await.unwrap();
        assert!(!harness.client.is_available());

        let result: Result<i32> = harness.client.call("Arith", "Add", &(2, 3)).await;
        assert!(matches!(result, Err(Error::Shutdown)));
        assert!(matches!(harness.client.close().await, Err(Error::Shutdown)));
        assert!(harness.written.lock().is_empty());
    }

    #[tokio::test]
    async fn close_fails_calls_still_waiting() {
        let harness = Harness::new();
        let submission = harness
            .client
            .go::<_, i32>("Arith", "Add", &(2, 3), None)
            .await;

        harness.client.close().await.unwrap();

        let call = submission.wait().await.unwrap();
        assert!(matches!(call.error, Some(Error::ConnectionClosed)));
        assert_eq!(harness.client.pending(), 0);
    }
}

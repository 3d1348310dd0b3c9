//! Logical channels multiplexed over one SSH connection.
//!
//! This module is the seam between the SSH transport and the channel
//! handlers. A transport announces a channel with [`NewChannel::pair`],
//! hands the [`NewChannel`] to the dispatcher and keeps the
//! [`ChannelOpening`], which resolves once a handler accepts or rejects.
//! After acceptance the two sides talk through plain tokio channels:
//!
//! - peer data flows into [`Channel::recv`] (end of stream is `None`),
//! - out-of-band requests flow into the [`Requests`] stream,
//! - everything the handler emits is queued as [`ChannelOutput`] in order.
//!
//! Data and extended data are metered: a channel holds at most
//! [`OUTPUT_WINDOW`] bytes the transport has not taken yet, and writers wait
//! (or, for the `try_` variants, fail with `WouldBlock`) until it catches up.
//! Control messages (EOF, exit status, close) are never held back.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use tokio::sync::{Semaphore, TryAcquireError, mpsc, oneshot};
use tokio_util::sync::PollSemaphore;
use tracing::trace;

use crate::{Error, Result};

/// Number of peer data chunks buffered before the transport waits.
pub const INPUT_BUFFER: usize = 1024;

/// Number of channel requests buffered before the transport waits.
pub const REQUEST_BUFFER: usize = 32;

/// Bytes of handler output a channel queues before writers wait.
pub const OUTPUT_WINDOW: usize = 256 * 1024;

/// Extended data type code for stderr (RFC 4254 §5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Reason codes for a rejected channel open (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    /// Returns the numeric reason code sent on the wire.
    pub const fn code(self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::AdministrativelyProhibited => "administratively prohibited",
            RejectReason::ConnectFailed => "connect failed",
            RejectReason::UnknownChannelType => "unknown channel type",
            RejectReason::ResourceShortage => "resource shortage",
        };
        f.write_str(text)
    }
}

/// A rejected channel open as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

/// Messages a channel handler sends back to the peer, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Primary data stream (stdout for sessions).
    Data(Bytes),
    /// Extended data; code 1 is stderr.
    ExtendedData { code: u32, data: Bytes },
    /// No more data will be sent in this direction.
    Eof,
    /// The `exit-status` request.
    ExitStatus(u32),
    /// The channel is closed; nothing follows.
    Close,
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

/// An out-of-band request (channel-level or connection-level).
pub struct Request {
    request_type: String,
    payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_type", &self.request_type)
            .field("payload_len", &self.payload.len())
            .field("want_reply", &self.want_reply())
            .finish()
    }
}

impl Request {
    /// Creates a request. When `want_reply` is set, the returned receiver
    /// resolves with the handler's answer.
    pub fn new(
        request_type: impl Into<String>,
        payload: Bytes,
        want_reply: bool,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let request = Self {
            request_type: request_type.into(),
            payload,
            reply,
        };
        (request, rx)
    }

    /// The request name, e.g. `"pty-req"`.
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// The raw request-specific data.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the peer waits for a reply.
    pub fn want_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answers the request. Does nothing if no reply was requested.
    pub fn reply(self, ok: bool) {
        if let Some(tx) = self.reply {
            let _ = tx.send(ok);
        }
    }
}

/// Stream of requests for one channel or connection.
pub type Requests = mpsc::Receiver<Request>;

/// Transport-side handle for submitting requests.
#[derive(Clone, Debug)]
pub struct RequestSender {
    tx: mpsc::Sender<Request>,
}

impl RequestSender {
    /// Wraps the sending half of a request stream.
    pub fn new(tx: mpsc::Sender<Request>) -> Self {
        Self { tx }
    }

    /// Submits a request and waits for the answer when one is wanted.
    ///
    /// Requests without a reply resolve to `true` once queued. A stream that
    /// is gone, or a request dropped unanswered, counts as failure.
    pub async fn send(&self, request_type: &str, payload: Bytes, want_reply: bool) -> bool {
        let (request, reply) = Request::new(request_type, payload, want_reply);
        if self.tx.send(request).await.is_err() {
            trace!(request_type, "request stream closed");
            return false;
        }
        match reply {
            Some(rx) => rx.await.unwrap_or(false),
            None => true,
        }
    }

    /// Returns true once the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// -----------------------------------------------------------------------------
// Channel open
// -----------------------------------------------------------------------------

type Decision = std::result::Result<TransportChannel, Rejection>;

/// A channel-open request waiting for a handler's decision.
pub struct NewChannel {
    channel_type: String,
    extra_data: Bytes,
    decision: oneshot::Sender<Decision>,
}

impl fmt::Debug for NewChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewChannel")
            .field("channel_type", &self.channel_type)
            .field("extra_data_len", &self.extra_data.len())
            .finish()
    }
}

impl NewChannel {
    /// Creates a pending channel open and the transport's view of it.
    pub fn pair(channel_type: impl Into<String>, extra_data: Bytes) -> (Self, ChannelOpening) {
        let (decision, rx) = oneshot::channel();
        let new_channel = Self {
            channel_type: channel_type.into(),
            extra_data,
            decision,
        };
        (new_channel, ChannelOpening { decision: rx })
    }

    /// The channel type, e.g. `"session"` or `"direct-tcpip"`.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Type-specific data sent with the open request.
    pub fn extra_data(&self) -> &Bytes {
        &self.extra_data
    }

    /// Accepts the channel, returning it together with its request stream.
    pub fn accept(self) -> (Channel, Requests) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_BUFFER);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(OUTPUT_WINDOW));

        let transport = TransportChannel {
            input: Some(input_tx),
            requests: RequestSender::new(request_tx),
            output: OutputReceiver {
                rx: output_rx,
                credit: credit.clone(),
            },
        };
        let writer = ChannelWriter {
            output: output_tx,
            credit,
            closed: Arc::new(AtomicBool::new(false)),
        };

        // If the transport stopped waiting, the channel below reads as
        // already hung up.
        let _ = self.decision.send(Ok(transport));

        let channel = Channel {
            channel_type: self.channel_type,
            input: input_rx,
            writer,
        };
        (channel, request_rx)
    }

    /// Rejects the channel.
    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        let _ = self.decision.send(Err(Rejection {
            reason,
            message: message.into(),
        }));
    }
}

/// The transport's handle on a channel open awaiting a decision.
#[derive(Debug)]
pub struct ChannelOpening {
    decision: oneshot::Receiver<Decision>,
}

impl ChannelOpening {
    /// Waits for the handler to accept or reject the channel.
    ///
    /// A [`NewChannel`] dropped without a decision is a rejection.
    pub async fn outcome(self) -> std::result::Result<TransportChannel, Rejection> {
        self.decision.await.unwrap_or_else(|_| {
            Err(Rejection {
                reason: RejectReason::ResourceShortage,
                message: "channel open abandoned".to_string(),
            })
        })
    }
}

// -----------------------------------------------------------------------------
// Accepted channel, handler side
// -----------------------------------------------------------------------------

/// An accepted channel as seen by its handler.
#[derive(Debug)]
pub struct Channel {
    channel_type: String,
    input: mpsc::Receiver<Bytes>,
    writer: ChannelWriter,
}

impl Channel {
    /// The channel type this channel was opened with.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Receives the next chunk of peer data; `None` once the peer sent EOF
    /// or the channel is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.input.recv().await
    }

    /// Returns a writer for this channel.
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// Splits the channel into its receiving and sending halves.
    pub fn split(self) -> (mpsc::Receiver<Bytes>, ChannelWriter) {
        (self.input, self.writer)
    }
}

/// A queued output message and the window credit it holds.
#[derive(Debug)]
struct Queued {
    message: ChannelOutput,
    credit: u32,
}

fn credit_for(len: usize) -> u32 {
    // OUTPUT_WINDOW fits in a u32.
    len.min(OUTPUT_WINDOW) as u32
}

/// Sending half of an accepted channel. Clones share the closed state and
/// the output window.
#[derive(Clone, Debug)]
pub struct ChannelWriter {
    output: mpsc::UnboundedSender<Queued>,
    credit: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl ChannelWriter {
    fn push(&self, message: ChannelOutput, credit: u32) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        self.output
            .send(Queued { message, credit })
            .map_err(|_| Error::PeerHangup)
    }

    async fn send_metered(&self, message: ChannelOutput, len: usize) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let credit = credit_for(len);
        // The transport closes the window when it goes away.
        let permit = self
            .credit
            .acquire_many(credit)
            .await
            .map_err(|_| Error::PeerHangup)?;
        permit.forget();
        self.push(message, credit)
    }

    fn try_send_metered(&self, message: ChannelOutput, len: usize) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let credit = credit_for(len);
        match self.credit.try_acquire_many(credit) {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => {
                return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
            }
            Err(TryAcquireError::Closed) => return Err(Error::PeerHangup),
        }
        self.push(message, credit)
    }

    /// Queues primary channel data, waiting while the output window is full.
    pub async fn data(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.send_metered(ChannelOutput::Data(data), len).await
    }

    /// Queues extended data with the given type code, waiting while the
    /// output window is full.
    pub async fn extended_data(&self, code: u32, data: Bytes) -> Result<()> {
        let len = data.len();
        self.send_metered(ChannelOutput::ExtendedData { code, data }, len).await
    }

    /// Queues primary channel data without waiting.
    ///
    /// Fails with an [`io::ErrorKind::WouldBlock`] error when the output
    /// window is full.
    pub fn try_data(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.try_send_metered(ChannelOutput::Data(data), len)
    }

    /// Queues extended data without waiting, see [`try_data`](Self::try_data).
    pub fn try_extended_data(&self, code: u32, data: Bytes) -> Result<()> {
        let len = data.len();
        self.try_send_metered(ChannelOutput::ExtendedData { code, data }, len)
    }

    /// Signals that no more data follows from this side.
    pub fn eof(&self) -> Result<()> {
        self.push(ChannelOutput::Eof, 0)
    }

    /// Sends the `exit-status` request.
    pub fn exit_status(&self, status: u32) -> Result<()> {
        self.push(ChannelOutput::ExitStatus(status), 0)
    }

    /// Closes the channel. Only the first call succeeds.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::StreamClosed);
        }
        self.output
            .send(Queued {
                message: ChannelOutput::Close,
                credit: 0,
            })
            .map_err(|_| Error::PeerHangup)
    }

    /// Returns whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the transport stopped taking output, i.e. the peer
    /// is gone.
    pub async fn hung_up(&self) {
        self.output.closed().await;
    }
}

/// A [`ChannelWriter`] driven from `poll_write`.
///
/// Each clone keeps its own pending wait for window credit.
#[derive(Clone, Debug)]
pub(crate) struct PollWriter {
    writer: ChannelWriter,
    credit: PollSemaphore,
}

impl PollWriter {
    pub(crate) fn new(writer: ChannelWriter) -> Self {
        let credit = PollSemaphore::new(writer.credit.clone());
        Self { writer, credit }
    }

    /// Queues up to [`OUTPUT_WINDOW`] bytes of `buf` as data, or as extended
    /// data when `code` is set. Pending while the output window is full.
    pub(crate) fn poll_write(
        &mut self,
        cx: &mut Context<'_>,
        code: Option<u32>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.writer.is_closed() {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        }
        let n = buf.len().min(OUTPUT_WINDOW);
        let credit = credit_for(n);
        match ready!(self.credit.poll_acquire_many(cx, credit)) {
            Some(permit) => permit.forget(),
            None => return Poll::Ready(Err(Error::PeerHangup.into())),
        }
        let data = Bytes::copy_from_slice(&buf[..n]);
        let message = match code {
            Some(code) => ChannelOutput::ExtendedData { code, data },
            None => ChannelOutput::Data(data),
        };
        Poll::Ready(
            self.writer
                .push(message, credit)
                .map(|()| n)
                .map_err(io::Error::from),
        )
    }
}

// -----------------------------------------------------------------------------
// Accepted channel, transport side
// -----------------------------------------------------------------------------

/// An accepted channel as seen by the transport (or a test peer).
#[derive(Debug)]
pub struct TransportChannel {
    input: Option<mpsc::Sender<Bytes>>,
    requests: RequestSender,
    output: OutputReceiver,
}

impl TransportChannel {
    /// Delivers peer data to the handler. Waits while the handler's input
    /// buffer is full.
    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        match &self.input {
            Some(input) => input.send(data).await.map_err(|_| Error::StreamClosed),
            None => Err(Error::StreamClosed),
        }
    }

    /// Signals end of peer data.
    pub fn send_eof(&mut self) {
        self.input = None;
    }

    /// Submits a channel request, see [`RequestSender::send`].
    pub async fn request(&self, request_type: &str, payload: Bytes, want_reply: bool) -> bool {
        self.requests.send(request_type, payload, want_reply).await
    }

    /// Receives the next message emitted by the handler.
    pub async fn recv_output(&mut self) -> Option<ChannelOutput> {
        self.output.recv().await
    }

    /// Splits into input sender, request sender and output receiver.
    pub fn into_parts(
        self,
    ) -> (
        Option<mpsc::Sender<Bytes>>,
        RequestSender,
        OutputReceiver,
    ) {
        (self.input, self.requests, self.output)
    }
}

/// The transport's stream of [`ChannelOutput`].
///
/// Taking a message hands its bytes back to the channel's output window.
/// Dropping the receiver fails every writer still waiting for room.
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
    credit: Arc<Semaphore>,
}

impl OutputReceiver {
    /// Receives the next message; `None` once every writer is gone.
    pub async fn recv(&mut self) -> Option<ChannelOutput> {
        let Queued { message, credit } = self.rx.recv().await?;
        self.credit.add_permits(credit as usize);
        Some(message)
    }
}

impl Drop for OutputReceiver {
    fn drop(&mut self) {
        self.credit.close();
    }
}

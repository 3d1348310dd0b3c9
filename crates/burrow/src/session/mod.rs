//! Interactive and exec sessions.
//!
//! A [`Session`] wraps one accepted `"session"` channel. It is a duplex byte
//! stream (stdin in, stdout out) with a separate stderr writer, plus the
//! side channels a remote shell needs: terminal allocation, window resizes,
//! signals and the exit status.
//!
//! The request loop in [`SessionChannelHandler`] owns the mutable side of
//! the session; the user [`Handler`](crate::Handler) gets a cloneable handle
//! and reads that state through the accessors below.
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{Server, ServerBuilder};
//!
//! let server = ServerBuilder::new()
//!     .address("127.0.0.1:2222")
//!     .handler(|session| async move {
//!         let (pty, windows, _) = session.pty();
//!         if let (Some(pty), Some(mut windows)) = (pty, windows) {
//!             burrow::println(&session, format!("term: {}", pty.term));
//!             while let Some(window) = windows.recv().await {
//!                 burrow::println(&session, format!("{}x{}", window.width, window.height));
//!             }
//!         }
//!     })
//!     .build()?;
//! ```

mod feed;
mod handler;

use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, mpsc, watch};

use crate::channel::{Channel, ChannelWriter, EXTENDED_DATA_STDERR, PollWriter};
use crate::signal::Signal;
use crate::{Context, Error, Pty, PublicKey, Result, Window};

pub use handler::SessionChannelHandler;

use feed::Feed;

/// Mutable session state, written by the request loop.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) pty: Option<Pty>,
    pub(crate) window: Window,
    pub(crate) windows: Feed<Window>,
    pub(crate) windows_claimed: bool,
    pub(crate) signals: Feed<Signal>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) raw_command: Option<String>,
    pub(crate) subsystem: Option<String>,
    pub(crate) started: bool,
    pub(crate) exited: bool,
}

#[derive(Debug)]
struct Input {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl Input {
    fn poll_chunk(&mut self, cx: &mut TaskContext<'_>) -> Poll<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Poll::Ready(Some(std::mem::take(&mut self.pending)));
        }
        self.rx.poll_recv(cx)
    }
}

struct Shared {
    context: Context,
    writer: ChannelWriter,
    input: Mutex<Input>,
    state: Mutex<State>,
    subscribed: Notify,
    closed: watch::Sender<bool>,
}

/// Handle on a running session. Clones share the same channel.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    output: PollWriter,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Session")
            .field("user", &self.shared.context.user())
            .field("remote_addr", &self.shared.context.remote_addr())
            .field("pty", &state.pty)
            .field("raw_command", &state.raw_command)
            .field("exited", &state.exited)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(context: Context, channel: Channel) -> Self {
        let (input, writer) = channel.split();
        let (closed, _) = watch::channel(false);
        Self {
            output: PollWriter::new(writer.clone()),
            shared: Arc::new(Shared {
                context,
                writer,
                input: Mutex::new(Input {
                    rx: input,
                    pending: Bytes::new(),
                }),
                state: Mutex::new(State::default()),
                subscribed: Notify::new(),
                closed,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock()
    }

    /// Woken whenever a window or signal consumer attaches.
    pub(crate) fn subscribed(&self) -> &Notify {
        &self.shared.subscribed
    }

    pub(crate) fn watch_closed(&self) -> watch::Receiver<bool> {
        self.shared.closed.subscribe()
    }

    // Identity

    /// Returns the authenticated user name.
    pub fn user(&self) -> &str {
        self.shared.context.user()
    }

    /// Returns the client's address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.context.remote_addr()
    }

    /// Returns the server address the client connected to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.context.local_addr()
    }

    /// Returns the connection context.
    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    /// Returns the public key the client authenticated with, if any.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.shared.context.public_key()
    }

    // Command and environment

    /// Returns the exec command split on whitespace; empty for shells.
    pub fn command(&self) -> Vec<String> {
        self.state()
            .raw_command
            .as_deref()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Returns the exec command exactly as sent.
    pub fn raw_command(&self) -> Option<String> {
        self.state().raw_command.clone()
    }

    /// Returns the requested subsystem name.
    pub fn subsystem(&self) -> Option<String> {
        self.state().subsystem.clone()
    }

    /// Returns the environment variables the client sent.
    pub fn environ(&self) -> HashMap<String, String> {
        self.state().env.clone()
    }

    /// Returns one environment variable.
    pub fn get_env(&self, name: &str) -> Option<String> {
        self.state().env.get(name).cloned()
    }

    // Terminal

    /// Returns the terminal request, the window change receiver and whether
    /// a terminal was requested.
    ///
    /// The receiver is handed out once, on the first call after the
    /// terminal request. It yields the initial window first, then one value
    /// per resize in arrival order, and ends when the session closes. The
    /// request loop waits for the receiver to take each value, so a holder
    /// must keep reading.
    pub fn pty(&self) -> (Option<Pty>, Option<mpsc::Receiver<Window>>, bool) {
        let mut state = self.state();
        let Some(pty) = state.pty.clone() else {
            return (None, None, false);
        };
        if state.windows_claimed {
            return (Some(pty), None, true);
        }
        state.windows_claimed = true;
        let (tx, rx) = mpsc::channel(1);
        state.windows.attach(tx);
        drop(state);
        self.shared.subscribed.notify_one();
        (Some(pty), Some(rx), true)
    }

    /// Returns the current window size, including resizes.
    pub fn window(&self) -> Window {
        self.state().window
    }

    /// Sends future signals to `tx`.
    ///
    /// Signals that arrived before the first registration are delivered
    /// first, in order. A later registration replaces the earlier one.
    /// Delivery waits while `tx` is full, which holds up the session's
    /// other requests, so the receiver must keep reading.
    pub fn signals(&self, tx: mpsc::Sender<Signal>) {
        self.state().signals.attach(tx);
        self.shared.subscribed.notify_one();
    }

    // Streams

    /// Receives the next chunk of client input; `None` at end of input.
    pub async fn recv(&self) -> Option<Bytes> {
        poll_fn(|cx| self.shared.input.lock().poll_chunk(cx)).await
    }

    /// Writes to stdout without waiting for the client.
    ///
    /// Fails with a `WouldBlock` I/O error once
    /// [`OUTPUT_WINDOW`](crate::channel::OUTPUT_WINDOW) bytes are queued;
    /// bulk output should go through the [`AsyncWrite`] impl instead.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.shared.writer.try_data(Bytes::copy_from_slice(data))?;
        Ok(data.len())
    }

    /// Writes to stderr without waiting, see [`write`](Self::write).
    pub fn write_stderr(&self, data: &[u8]) -> Result<usize> {
        self.shared
            .writer
            .try_extended_data(EXTENDED_DATA_STDERR, Bytes::copy_from_slice(data))?;
        Ok(data.len())
    }

    /// Returns a writer for stderr.
    pub fn stderr(&self) -> Stderr {
        Stderr {
            writer: self.shared.writer.clone(),
            output: PollWriter::new(self.shared.writer.clone()),
        }
    }

    // Lifecycle

    /// Sends the exit status and closes the channel.
    ///
    /// Fails with [`Error::StreamClosed`] if the session already exited or
    /// was closed.
    pub fn exit(&self, status: u32) -> Result<()> {
        let mut state = self.state();
        if state.exited || self.shared.writer.is_closed() {
            return Err(Error::StreamClosed);
        }
        state.exited = true;
        let sent = self.shared.writer.exit_status(status);
        let closed = self.shared.writer.close();
        drop(state);

        self.shared.closed.send_replace(true);
        sent.and(closed)
    }

    /// Closes the channel without an exit status.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.exited = true;
        let closed = self.shared.writer.close();
        drop(state);

        self.shared.closed.send_replace(true);
        closed
    }

    /// Returns true once the session exited, was closed, or lost its peer.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Waits until the session is closed.
    pub async fn closed(&self) {
        let mut closed = self.watch_closed();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Ends the session from the request loop's side: consumers see their
    /// receivers end and no more events are queued.
    pub(crate) fn terminate(&self) {
        let mut state = self.state();
        state.windows.close();
        state.signals.close();
        drop(state);
        self.shared.closed.send_replace(true);
    }

    /// Closes the channel if nothing else did.
    pub(crate) fn release(&self) {
        let _ = self.shared.writer.close();
    }
}

impl AsyncRead for Session {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut input = self.shared.input.lock();
        loop {
            if input.pending.is_empty() {
                match input.rx.poll_recv(cx) {
                    Poll::Ready(Some(chunk)) => input.pending = chunk,
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
                continue;
            }
            let n = buf.remaining().min(input.pending.len());
            buf.put_slice(&input.pending.split_to(n));
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for Session {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().output.poll_write(cx, None, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(match self.shared.writer.eof() {
            Ok(()) | Err(Error::StreamClosed) => Ok(()),
            Err(err) => Err(err.into()),
        })
    }
}

impl io::Write for Session {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer for a session's stderr stream.
///
/// `io::Write` never waits and reports `WouldBlock` while the output window
/// is full; `AsyncWrite` waits for room.
#[derive(Clone, Debug)]
pub struct Stderr {
    writer: ChannelWriter,
    output: PollWriter,
}

impl io::Write for Stderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .try_extended_data(EXTENDED_DATA_STDERR, Bytes::copy_from_slice(buf))
            .map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncWrite for Stderr {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .output
            .poll_write(cx, Some(EXTENDED_DATA_STDERR), buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

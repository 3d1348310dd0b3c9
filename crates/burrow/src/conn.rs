//! Per-connection channel dispatch.
//!
//! A transport and the dispatcher meet through [`link`]: the transport keeps
//! the [`Link`] and reports authentication, channel opens and
//! connection-level requests through it, while [`serve`] consumes the
//! [`Incoming`] half and routes every new channel to the [`ChannelHandler`]
//! registered for its type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelOpening, NewChannel, RejectReason, RequestSender, Requests};
use crate::{Context, Error, Result};

/// Buffered channel-open requests per connection.
const OPEN_BUFFER: usize = 16;

/// Handles channels of one type.
///
/// The handler owns the [`NewChannel`]: it must accept or reject it, and
/// once accepted it owns the channel until it is closed.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Runs one channel to completion.
    async fn handle(&self, ctx: Context, channel: NewChannel);
}

/// Channel handlers keyed by channel type.
///
/// Connections hold their own snapshot, so registering a handler later only
/// affects connections accepted afterwards.
pub type ChannelHandlers = Arc<HashMap<String, Arc<dyn ChannelHandler>>>;

/// Creates the two ends of a connection.
pub fn link() -> (Link, Incoming) {
    let (auth_tx, auth_rx) = oneshot::channel();
    let (open_tx, open_rx) = mpsc::channel(OPEN_BUFFER);
    let (global_tx, global_rx) = mpsc::channel(crate::channel::REQUEST_BUFFER);

    let link = Link {
        auth: Some(auth_tx),
        opens: open_tx,
        globals: RequestSender::new(global_tx),
    };
    let incoming = Incoming {
        auth: auth_rx,
        opens: open_rx,
        globals: global_rx,
    };
    (link, incoming)
}

/// Transport side of a connection.
///
/// Dropping the link ends the connection: before authentication that is a
/// failed handshake, afterwards every channel on it is closed.
#[derive(Debug)]
pub struct Link {
    auth: Option<oneshot::Sender<Context>>,
    opens: mpsc::Sender<NewChannel>,
    globals: RequestSender,
}

impl Link {
    /// Reports a completed handshake. Only the first call has an effect.
    pub fn authenticate(&mut self, ctx: Context) {
        if let Some(auth) = self.auth.take() {
            let _ = auth.send(ctx);
        }
    }

    /// Returns true once [`authenticate`](Self::authenticate) was called.
    pub fn is_authenticated(&self) -> bool {
        self.auth.is_none()
    }

    /// Announces a new channel. Returns `None` when the connection is no
    /// longer being served.
    pub async fn open_channel(
        &self,
        channel_type: &str,
        extra_data: Bytes,
    ) -> Option<ChannelOpening> {
        let (new_channel, opening) = NewChannel::pair(channel_type, extra_data);
        self.opens.send(new_channel).await.ok()?;
        Some(opening)
    }

    /// Submits a connection-level request and waits for its answer.
    pub async fn global_request(&self, request_type: &str, payload: Bytes) -> bool {
        self.globals.send(request_type, payload, true).await
    }
}

/// Dispatcher side of a connection, consumed by [`serve`].
#[derive(Debug)]
pub struct Incoming {
    auth: oneshot::Receiver<Context>,
    opens: mpsc::Receiver<NewChannel>,
    globals: Requests,
}

/// Serves one connection until its transport goes away.
///
/// Waits for the handshake, then accepts channels and runs each handler in
/// its own task. Channels whose type has no handler are rejected with
/// [`RejectReason::UnknownChannelType`]. Connection-level requests are
/// answered with failure. When the loop ends, handlers still running are
/// cancelled.
pub async fn serve(incoming: Incoming, handlers: ChannelHandlers) -> Result<()> {
    let Incoming {
        auth,
        mut opens,
        mut globals,
    } = incoming;

    let Ok(ctx) = auth.await else {
        debug!("transport closed before authentication");
        return Err(Error::HandshakeFailed(
            "connection closed before authentication completed".to_string(),
        ));
    };

    let connection_id = ctx.connection_id();
    debug!(connection_id, user = %ctx.user(), remote_addr = %ctx.remote_addr(), "serving connection");

    let mut tasks = JoinSet::new();
    let mut globals_open = true;

    loop {
        tokio::select! {
            opened = opens.recv() => {
                let Some(new_channel) = opened else { break };
                dispatch(&ctx, &handlers, new_channel, &mut tasks);
            }
            request = globals.recv(), if globals_open => match request {
                Some(request) => {
                    debug!(connection_id, request_type = request.request_type(), "refusing global request");
                    request.reply(false);
                }
                None => globals_open = false,
            },
            Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = finished {
                    if err.is_panic() {
                        error!(connection_id, "channel handler panicked");
                    }
                }
            }
        }
    }

    if !tasks.is_empty() {
        debug!(connection_id, channels = tasks.len(), "closing remaining channels");
    }
    tasks.shutdown().await;
    debug!(connection_id, "connection finished");
    Ok(())
}

fn dispatch(
    ctx: &Context,
    handlers: &ChannelHandlers,
    new_channel: NewChannel,
    tasks: &mut JoinSet<()>,
) {
    let channel_type = new_channel.channel_type().to_string();
    let Some(handler) = handlers.get(&channel_type) else {
        let err = Error::UnsupportedChannelType(channel_type);
        warn!(connection_id = ctx.connection_id(), error = %err, "rejecting channel");
        new_channel.reject(RejectReason::UnknownChannelType, err.to_string());
        return;
    };

    trace!(connection_id = ctx.connection_id(), channel_type = %channel_type, "dispatching channel");
    let handler = Arc::clone(handler);
    let ctx = ctx.clone();
    tasks.spawn(async move { handler.handle(ctx, new_channel).await });
}

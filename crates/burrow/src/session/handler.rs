//! The `"session"` channel handler and its request loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use super::Session;
use crate::channel::{NewChannel, Request, Requests};
use crate::conn::ChannelHandler;
use crate::signal::Signal;
use crate::wire::{
    EnvPayload, ExecPayload, Payload, PtyRequestPayload, SignalPayload, SubsystemPayload,
    WindowChangePayload,
};
use crate::{Context, Error, Handler, Pty, Window};

/// Serves `"session"` channels by running a [`Handler`] per session.
#[derive(Clone)]
pub struct SessionChannelHandler {
    handler: Handler,
    subsystems: Arc<HashMap<String, Handler>>,
}

impl std::fmt::Debug for SessionChannelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannelHandler")
            .field("subsystems", &self.subsystems.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionChannelHandler {
    /// Creates a session handler running `handler` for shells and exec
    /// commands.
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            subsystems: Arc::new(HashMap::new()),
        }
    }

    /// Sets the handlers for `subsystem` requests, keyed by name.
    pub fn with_subsystems(mut self, subsystems: HashMap<String, Handler>) -> Self {
        self.subsystems = Arc::new(subsystems);
        self
    }
}

#[async_trait]
impl ChannelHandler for SessionChannelHandler {
    async fn handle(&self, ctx: Context, channel: NewChannel) {
        let (channel, requests) = channel.accept();
        let session = Session::new(ctx, channel);
        debug!(
            connection_id = session.context().connection_id(),
            user = %session.user(),
            "session opened"
        );

        let running = RequestLoop {
            session: session.clone(),
            handler: Arc::clone(&self.handler),
            subsystems: Arc::clone(&self.subsystems),
            running: JoinSet::new(),
        }
        .run(requests)
        .await;

        // Let the handler observe the closed session before the channel goes.
        drain(running).await;
        session.release();
        debug!(
            connection_id = session.context().connection_id(),
            "session closed"
        );
    }
}

async fn drain(mut running: JoinSet<()>) {
    while let Some(result) = running.join_next().await {
        if let Err(err) = result {
            if err.is_panic() {
                error!("session task panicked outside the handler");
            }
        }
    }
}

/// Closes the session's feeds however the loop ends, including when the
/// task is cancelled.
struct Terminate(Session);

impl Drop for Terminate {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

struct RequestLoop {
    session: Session,
    handler: Handler,
    subsystems: Arc<HashMap<String, Handler>>,
    running: JoinSet<()>,
}

impl RequestLoop {
    /// Processes requests in arrival order until the session or the
    /// request stream closes. Returns the handler task, if one started.
    async fn run(mut self, mut requests: Requests) -> JoinSet<()> {
        let _terminate = Terminate(self.session.clone());
        let mut closed = self.session.watch_closed();

        loop {
            let step = async {
                tokio::select! {
                    biased;
                    () = self.session.subscribed().notified() => {
                        self.flush().await;
                        true
                    }
                    request = requests.recv() => match request {
                        Some(request) => {
                            self.dispatch(request).await;
                            true
                        }
                        None => false,
                    },
                }
            };

            tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => break,
                more = step => if !more { break },
            }
        }

        trace!("session request loop finished");
        self.running
    }

    async fn dispatch(&mut self, request: Request) {
        let request_type = request.request_type().to_string();
        let ok = match request_type.as_str() {
            "pty-req" => self.pty_request(&request),
            "window-change" => self.window_change(&request).await,
            "signal" => {
                self.signal(&request).await;
                true
            }
            "env" => self.env(&request),
            "shell" | "exec" | "subsystem" => self.start(&request),
            _ => {
                debug!(request_type = %request_type, "unsupported session request");
                false
            }
        };
        trace!(request_type = %request_type, ok, "session request handled");
        request.reply(ok);
    }

    fn pty_request(&self, request: &Request) -> bool {
        let payload = match PtyRequestPayload::from_bytes(request.payload()) {
            Ok(payload) => payload,
            Err(err) => return malformed(request, err.into()),
        };

        let mut state = self.session.state();
        if state.pty.is_some() {
            return duplicate(request);
        }
        let window = Window {
            width: payload.width,
            height: payload.height,
        };
        state.pty = Some(Pty {
            term: payload.term,
            window,
            modes: payload.modes,
        });
        state.window = window;
        state.windows.push(window);
        true
    }

    async fn window_change(&self, request: &Request) -> bool {
        let payload = match WindowChangePayload::from_bytes(request.payload()) {
            Ok(payload) => payload,
            Err(err) => return malformed(request, err.into()),
        };

        {
            let mut state = self.session.state();
            if state.pty.is_none() {
                debug!("window-change without a terminal");
                return false;
            }
            let window = Window {
                width: payload.width,
                height: payload.height,
            };
            state.window = window;
            if !state.windows.push(window) {
                warn!(?window, "window change backlog full, dropping resize");
            }
        }
        self.flush().await;
        true
    }

    async fn signal(&self, request: &Request) {
        let name = match SignalPayload::from_bytes(request.payload()) {
            Ok(payload) => payload.name,
            Err(err) => {
                malformed(request, err.into());
                return;
            }
        };
        let Some(signal) = Signal::from_name(&name) else {
            debug!(signal = %name, "ignoring unknown signal");
            return;
        };

        if !self.session.state().signals.push(signal) {
            warn!(%signal, "signal backlog full, dropping signal");
            return;
        }
        self.flush().await;
    }

    fn env(&self, request: &Request) -> bool {
        match EnvPayload::from_bytes(request.payload()) {
            Ok(payload) => {
                self.session.state().env.insert(payload.name, payload.value);
                true
            }
            Err(err) => malformed(request, err.into()),
        }
    }

    /// Starts the handler for `shell`, `exec` or `subsystem`.
    fn start(&mut self, request: &Request) -> bool {
        if self.session.state().started {
            return duplicate(request);
        }

        let handler = match request.request_type() {
            "exec" => match ExecPayload::from_bytes(request.payload()) {
                Ok(payload) => {
                    self.session.state().raw_command = Some(payload.command);
                    Arc::clone(&self.handler)
                }
                Err(err) => return malformed(request, err.into()),
            },
            "subsystem" => {
                let name = match SubsystemPayload::from_bytes(request.payload()) {
                    Ok(payload) => payload.name,
                    Err(err) => return malformed(request, err.into()),
                };
                let Some(handler) = self.subsystems.get(&name) else {
                    debug!(subsystem = %name, "unknown subsystem");
                    return false;
                };
                self.session.state().subsystem = Some(name);
                Arc::clone(handler)
            }
            _ => Arc::clone(&self.handler),
        };

        self.session.state().started = true;
        let session = self.session.clone();
        self.running.spawn(async move {
            let outcome = AssertUnwindSafe(handler(session.clone()))
                .catch_unwind()
                .await;
            let status = match outcome {
                Ok(()) => 0,
                Err(panic) => {
                    error!(
                        user = %session.user(),
                        panic = panic_message(panic.as_ref()),
                        "session handler panicked"
                    );
                    1
                }
            };
            // A handler that already exited or closed keeps its outcome.
            let _ = session.exit(status);
        });
        true
    }

    /// Hands queued window changes and signals to their consumers, waiting
    /// for each consumer to take them.
    async fn flush(&self) {
        loop {
            let next = self.session.state().windows.next();
            let Some((consumer, window)) = next else { break };
            if consumer.send(window).await.is_err() {
                self.session.state().windows.detach(&consumer);
            }
        }
        loop {
            let next = self.session.state().signals.next();
            let Some((consumer, signal)) = next else { break };
            if consumer.send(signal).await.is_err() {
                self.session.state().signals.detach(&consumer);
            }
        }
    }
}

fn malformed(request: &Request, err: Error) -> bool {
    debug!(request_type = request.request_type(), error = %err, "rejecting request");
    false
}

fn duplicate(request: &Request) -> bool {
    let err = Error::DuplicateRequest(request.request_type().to_string());
    debug!(error = %err, "rejecting request");
    false
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

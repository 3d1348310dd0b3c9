//! russh Handler implementation for burrow servers.
//!
//! One [`ConnectionHandler`] serves one SSH connection. It answers the
//! authentication callbacks from the configured [`ServerOptions`], then
//! translates russh's per-channel callbacks into the transport-neutral
//! types of [`crate::channel`] and feeds them to the connection's
//! dispatcher through a [`Link`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler as RusshHandler, Msg, Session as RusshSession};
use russh::{Channel, ChannelId};
use russh_keys::PublicKeyBase64;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::channel::{ChannelOutput, OutputReceiver, RequestSender};
use crate::conn::Link;
use crate::signal::russh_signal_name;
use crate::tcpip::{DIRECT_TCPIP, FORWARDED_TCPIP};
use crate::wire::{
    DirectTcpipPayload, EnvPayload, ExecPayload, Payload, PtyRequestPayload, SignalPayload,
    SubsystemPayload, TcpipForwardPayload, WindowChangePayload, X11Payload,
};
use crate::{Context, Error, PublicKey, SESSION, ServerOptions, X11};

// Re-export russh server types for use by Server
pub use russh::server::{Config as RusshConfig, run_stream};

/// Shared state for all connections to a server.
pub struct ServerState {
    /// Server options.
    pub options: ServerOptions,
    connection_counter: AtomicU64,
}

impl ServerState {
    /// Creates new server state from options.
    pub fn new(options: ServerOptions) -> Self {
        Self {
            options,
            connection_counter: AtomicU64::new(0),
        }
    }

    /// Returns the next connection ID.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn has_auth_callbacks(&self) -> bool {
        self.options.password_handler.is_some() || self.options.public_key_handler.is_some()
    }
}

/// Per-channel plumbing towards the dispatcher.
struct ChannelSlot {
    /// Client data; `None` after EOF.
    input: Option<mpsc::Sender<Bytes>>,
    requests: RequestSender,
    /// Dropped with the slot, which stops the output pump.
    _hangup: oneshot::Sender<()>,
}

/// Handler for a single SSH connection.
pub struct ConnectionHandler {
    connection_id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    /// User after authentication.
    user: Option<String>,
    /// Public key if authenticated with one.
    public_key: Option<PublicKey>,
    link: Link,
    channels: HashMap<ChannelId, ChannelSlot>,
    server_state: Arc<ServerState>,
}

impl ConnectionHandler {
    /// Creates a handler for a new connection.
    pub fn new(
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        server_state: Arc<ServerState>,
        link: Link,
    ) -> Self {
        let connection_id = server_state.next_connection_id();
        debug!(
            connection_id,
            remote_addr = %remote_addr,
            "New connection handler created"
        );

        Self {
            connection_id,
            remote_addr,
            local_addr,
            user: None,
            public_key: None,
            link,
            channels: HashMap::new(),
            server_state,
        }
    }

    /// Returns the connection ID.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn auth_context(&self, user: &str) -> Context {
        Context::new(user, self.remote_addr, self.local_addr).with_connection_id(self.connection_id)
    }

    fn accept(&mut self, user: &str, method: &'static str) -> Auth {
        info!(
            connection_id = self.connection_id,
            user = user,
            method,
            "Authentication accepted"
        );
        self.user = Some(user.to_string());
        Auth::Accept
    }

    fn reject(&self, user: &str, method: &'static str) -> Auth {
        debug!(
            connection_id = self.connection_id,
            user = user,
            method,
            "Authentication rejected"
        );
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Hands the authenticated context to the dispatcher the first time the
    /// client uses the connection.
    fn establish(&mut self) {
        if self.link.is_authenticated() {
            return;
        }
        let user = self.user.clone().unwrap_or_default();
        let mut ctx = self.auth_context(&user);
        if let Some(key) = self.public_key.clone() {
            ctx = ctx.with_public_key(key);
        }
        self.link.authenticate(ctx);
    }

    /// Converts a russh public key to our PublicKey type.
    fn convert_public_key(key: &russh_keys::key::PublicKey) -> PublicKey {
        let key_type = match key.name() {
            "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
            other => other,
        };
        PublicKey::new(key_type, key.public_key_bytes())
    }

    async fn open(
        &mut self,
        channel: Channel<Msg>,
        channel_type: &str,
        extra_data: Bytes,
        session: &mut RusshSession,
    ) -> Result<bool, Error> {
        self.establish();
        let channel_id = channel.id();

        let Some(opening) = self.link.open_channel(channel_type, extra_data).await else {
            debug!(connection_id = self.connection_id, channel = ?channel_id, "Dispatcher gone, refusing channel");
            return Ok(false);
        };

        match opening.outcome().await {
            Ok(accepted) => {
                debug!(
                    connection_id = self.connection_id,
                    channel = ?channel_id,
                    channel_type,
                    "Channel opened"
                );
                let (input, requests, output) = accepted.into_parts();
                let (hangup_tx, hangup_rx) = oneshot::channel();
                tokio::spawn(pump_output(
                    self.connection_id,
                    channel,
                    session.handle(),
                    output,
                    hangup_rx,
                ));
                self.channels.insert(
                    channel_id,
                    ChannelSlot {
                        input,
                        requests,
                        _hangup: hangup_tx,
                    },
                );
                Ok(true)
            }
            Err(rejection) => {
                // russh 0.46 always reports a generic failure code to the peer.
                debug!(
                    connection_id = self.connection_id,
                    channel = ?channel_id,
                    channel_type,
                    reason = %rejection.reason,
                    message = %rejection.message,
                    "Channel open rejected"
                );
                Ok(false)
            }
        }
    }

    /// Passes a channel request to the channel's handler. Requests that
    /// want a reply are answered with the handler's verdict.
    async fn forward(
        &mut self,
        channel: ChannelId,
        request_type: &str,
        payload: Bytes,
        want_reply: bool,
        session: &mut RusshSession,
    ) {
        let requests = self
            .channels
            .get(&channel)
            .map(|slot| slot.requests.clone());
        let ok = match requests {
            Some(requests) => requests.send(request_type, payload, want_reply).await,
            None => false,
        };
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            request_type,
            ok,
            "Channel request"
        );
        if want_reply {
            if ok {
                session.channel_success(channel);
            } else {
                session.channel_failure(channel);
            }
        }
    }
}

/// Writes a channel's output to russh in order until the channel closes or
/// the peer goes away.
async fn pump_output(
    connection_id: u64,
    mut channel: Channel<Msg>,
    handle: Handle,
    mut output: OutputReceiver,
    mut hangup: oneshot::Receiver<()>,
) {
    let channel_id = channel.id();
    trace!(connection_id, channel = ?channel_id, "Starting output pump");
    loop {
        let message = tokio::select! {
            message = output.recv() => message,
            _ = &mut hangup => break,
            // The handler callbacks already saw these; keep russh's
            // per-channel queue from filling up.
            incoming = channel.wait() => match incoming {
                Some(_) => continue,
                None => break,
            },
        };
        let sent = match message {
            Some(ChannelOutput::Data(data)) => channel.data(&data[..]).await.is_ok(),
            Some(ChannelOutput::ExtendedData { code, data }) => {
                channel.extended_data(code, &data[..]).await.is_ok()
            }
            Some(ChannelOutput::Eof) => channel.eof().await.is_ok(),
            Some(ChannelOutput::ExitStatus(status)) => {
                handle.exit_status_request(channel_id, status).await.is_ok()
            }
            Some(ChannelOutput::Close) | None => break,
        };
        if !sent {
            break;
        }
    }
    let _ = channel.close().await;
    trace!(connection_id, channel = ?channel_id, "Output pump finished");
}

#[async_trait]
impl RusshHandler for ConnectionHandler {
    type Error = Error;

    /// Handle public key authentication.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        debug!(
            connection_id = self.connection_id,
            user = user,
            key_type = public_key.name(),
            "Public key auth attempt"
        );

        if let Some(handler) = self.server_state.options.public_key_handler.clone() {
            let key = Self::convert_public_key(public_key);
            if handler(&self.auth_context(user), &key) {
                self.public_key = Some(key);
                return Ok(self.accept(user, "publickey"));
            }
        }
        Ok(self.reject(user, "publickey"))
    }

    /// Handle password authentication.
    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        debug!(
            connection_id = self.connection_id,
            user = user,
            "Password auth attempt"
        );

        if let Some(handler) = self.server_state.options.password_handler.clone() {
            if handler(&self.auth_context(user), password) {
                return Ok(self.accept(user, "password"));
            }
        }
        Ok(self.reject(user, "password"))
    }

    /// Accepts "none" authentication when no callbacks are configured.
    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        if self.server_state.has_auth_callbacks() {
            return Ok(self.reject(user, "none"));
        }
        Ok(self.accept(user, "none"))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        self.open(channel, SESSION, Bytes::new(), session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        let extra_data = DirectTcpipPayload {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_host: originator_address.to_string(),
            originator_port,
        }
        .to_bytes();
        self.open(channel, DIRECT_TCPIP, extra_data, session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        originator_address: &str,
        originator_port: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        let extra_data = X11Payload {
            originator_host: originator_address.to_string(),
            originator_port,
        }
        .to_bytes();
        self.open(channel, X11, extra_data, session).await
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        let extra_data = DirectTcpipPayload {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_host: originator_address.to_string(),
            originator_port,
        }
        .to_bytes();
        self.open(channel, FORWARDED_TCPIP, extra_data, session).await
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = PtyRequestPayload {
            term: term.to_string(),
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
            modes: modes.iter().map(|(op, value)| (*op as u8, *value)).collect(),
        }
        .to_bytes();
        self.forward(channel, "pty-req", payload, true, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        self.forward(channel, "shell", Bytes::new(), true, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = ExecPayload {
            command: String::from_utf8_lossy(data).into_owned(),
        }
        .to_bytes();
        self.forward(channel, "exec", payload, true, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = SubsystemPayload {
            name: name.to_string(),
        }
        .to_bytes();
        self.forward(channel, "subsystem", payload, true, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = EnvPayload {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        }
        .to_bytes();
        self.forward(channel, "env", payload, false, session).await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = WindowChangePayload {
            width: col_width,
            height: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        }
        .to_bytes();
        self.forward(channel, "window-change", payload, false, session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: russh::Sig,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        let payload = SignalPayload {
            name: russh_signal_name(&signal),
        }
        .to_bytes();
        self.forward(channel, "signal", payload, false, session).await;
        Ok(())
    }

    /// Handle data from client.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            len = data.len(),
            "Data received"
        );

        let input = self
            .channels
            .get(&channel)
            .and_then(|slot| slot.input.clone());
        if let Some(input) = input {
            // Waits while the channel handler is behind on its input.
            if input.send(Bytes::copy_from_slice(data)).await.is_err() {
                trace!(connection_id = self.connection_id, channel = ?channel, "Channel input closed");
            }
        }
        Ok(())
    }

    /// Handle channel EOF.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Channel EOF"
        );
        if let Some(slot) = self.channels.get_mut(&channel) {
            slot.input = None;
        }
        Ok(())
    }

    /// Handle channel close.
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            "Channel closed"
        );
        self.channels.remove(&channel);
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        self.establish();
        let payload = TcpipForwardPayload {
            address: address.to_string(),
            port: *port,
        }
        .to_bytes();
        Ok(self.link.global_request("tcpip-forward", payload).await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        self.establish();
        let payload = TcpipForwardPayload {
            address: address.to_string(),
            port,
        }
        .to_bytes();
        Ok(self.link.global_request("cancel-tcpip-forward", payload).await)
    }
}

#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Burrow
//!
//! An SSH server library built around channels.
//!
//! Every SSH connection carries any number of logical channels. Burrow
//! accepts connections, routes each new channel to the handler registered
//! for its type and ships two handlers:
//!
//! - **Sessions** (`"session"`): a remote shell or command as a plain async
//!   byte stream, with terminal allocation, window resizes, signals, stderr
//!   and exit status.
//! - **Tunnels** (`"direct-tcpip"`, opt-in): dial a TCP target on behalf of
//!   the client and relay bytes both ways.
//!
//! ## Example
//!
//! ```rust,ignore
//! use burrow::{DirectTcpipHandler, ServerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), burrow::Error> {
//!     let server = ServerBuilder::new()
//!         .address("0.0.0.0:2222")
//!         .channel_handler("direct-tcpip", DirectTcpipHandler::new())
//!         .handler(|session| async move {
//!             burrow::println(&session, format!("Hello, {}!", session.user()));
//!         })
//!         .build()?;
//!
//!     server.listen().await
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub mod channel;
pub mod conn;
mod handler;
pub mod session;
pub mod signal;
pub mod tcpip;
pub mod wire;

pub use channel::{Channel, ChannelWriter, NewChannel, RejectReason, Request};
pub use conn::{ChannelHandler, ChannelHandlers};
pub use handler::{ConnectionHandler, RusshConfig, ServerState, run_stream};
pub use session::{Session, SessionChannelHandler, Stderr};
pub use signal::Signal;
pub use tcpip::{DirectTcpipHandler, bridge};
pub use wire::WireError;

/// Channel type of interactive and exec sessions.
pub const SESSION: &str = "session";

/// Channel type of X11 connections. No handler is registered for it by
/// default.
pub const X11: &str = "x11";

/// Default maximum authentication attempts per connection.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default delay before answering a rejected authentication, in milliseconds.
pub const DEFAULT_AUTH_REJECTION_DELAY_MS: u64 = 100;

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur in a burrow server.
///
/// Failures scoped to one channel or one request are handled where they
/// happen and never tear down the connection; they surface here so callers
/// and logs can tell them apart.
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`Io`](Error::Io) | Check permissions, port availability |
/// | [`Russh`](Error::Russh) | Check SSH protocol compatibility |
/// | [`Key`](Error::Key) / [`KeyLoad`](Error::KeyLoad) | Verify host key format |
/// | [`HandshakeFailed`](Error::HandshakeFailed) | Expected for rejected clients |
/// | [`UnsupportedChannelType`](Error::UnsupportedChannelType) | Register a handler for the type |
/// | [`MalformedPayload`](Error::MalformedPayload) | Request is refused; session continues |
/// | [`DuplicateRequest`](Error::DuplicateRequest) | Request is refused; session continues |
/// | [`StreamClosed`](Error::StreamClosed) | Stop writing; the session has exited |
/// | [`Dial`](Error::Dial) | Tunnel refused; check the target |
/// | [`PeerHangup`](Error::PeerHangup) | Clean up; the client is gone |
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during server operations.
    ///
    /// Commonly occurs when:
    /// - The bind address is already in use
    /// - Permission denied on privileged ports
    /// - A tunnel's TCP stream fails mid-transfer
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Underlying russh library error.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// Host key could not be decoded.
    #[error("key error: {0}")]
    Key(String),

    /// Key loading error from russh-keys.
    ///
    /// Common causes: file not found, invalid format, permission denied.
    #[error("key loading error: {0}")]
    KeyLoad(#[from] russh_keys::Error),

    /// Server configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// The transport handshake or authentication did not complete.
    ///
    /// The connection is dropped and no channel is ever served.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A channel was opened with a type that has no registered handler.
    #[error("unsupported channel type: {0}")]
    UnsupportedChannelType(String),

    /// A request or channel-open payload could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] WireError),

    /// A one-time request (`pty-req`, `shell`, `exec`, `subsystem`) was
    /// repeated.
    #[error("duplicate {0} request")]
    DuplicateRequest(String),

    /// Write or exit after the channel was closed.
    #[error("stream closed")]
    StreamClosed,

    /// A `direct-tcpip` target could not be reached.
    #[error("failed to dial {target}: {source}")]
    Dial {
        /// The `host:port` that was dialed.
        target: String,
        #[source]
        source: io::Error,
    },

    /// The client closed the channel or the connection.
    #[error("peer hung up")]
    PeerHangup,
}

/// A specialized [`Result`] type for burrow operations.
///
/// This type alias defaults to [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::StreamClosed | Error::PeerHangup => {
                io::Error::new(io::ErrorKind::BrokenPipe, err)
            }
            other => io::Error::other(other),
        }
    }
}

/// A session that ended with a non-zero exit status.
///
/// Built on the client side of a session from the status it received.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("process exited with status {status}")]
pub struct ExitError {
    status: u32,
}

impl ExitError {
    /// Returns `Ok` for status 0 and an error carrying the status otherwise.
    pub fn check(status: u32) -> std::result::Result<(), ExitError> {
        if status == 0 {
            Ok(())
        } else {
            Err(ExitError { status })
        }
    }

    /// Returns the exit status.
    pub fn status(&self) -> u32 {
        self.status
    }
}

// -----------------------------------------------------------------------------
// PTY Types
// -----------------------------------------------------------------------------

/// Window size information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Pseudo-terminal request, as it was when the terminal was granted.
///
/// Later resizes do not change this value; read [`Session::window`] for the
/// current size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type (e.g., "xterm-256color").
    pub term: String,
    /// Window dimensions.
    pub window: Window,
    /// Encoded terminal modes as `(opcode, value)` pairs.
    pub modes: Vec<(u8, u32)>,
}

impl Default for Pty {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            window: Window::default(),
            modes: Vec::new(),
        }
    }
}

// -----------------------------------------------------------------------------
// Public Key Types
// -----------------------------------------------------------------------------

/// A public key used for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// The key type (e.g., "ssh-ed25519", "ssh-rsa").
    pub key_type: String,
    /// The raw key data.
    pub data: Vec<u8>,
}

impl PublicKey {
    /// Creates a new public key.
    pub fn new(key_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            data,
        }
    }
}

// -----------------------------------------------------------------------------
// Context
// -----------------------------------------------------------------------------

/// Connection details shared by every channel of one connection.
#[derive(Debug, Clone)]
pub struct Context {
    /// The authenticated username.
    user: String,
    /// The remote address.
    remote_addr: SocketAddr,
    /// The local address.
    local_addr: SocketAddr,
    /// Server-assigned connection number.
    connection_id: u64,
    /// Key used for authentication, if any.
    public_key: Option<PublicKey>,
}

impl Context {
    /// Creates a new context.
    pub fn new(user: impl Into<String>, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            user: user.into(),
            remote_addr,
            local_addr,
            connection_id: 0,
            public_key: None,
        }
    }

    /// Sets the connection number.
    pub fn with_connection_id(mut self, connection_id: u64) -> Self {
        self.connection_id = connection_id;
        self
    }

    /// Sets the key the client authenticated with.
    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Returns the username.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the connection number.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns the key the client authenticated with.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }
}

// -----------------------------------------------------------------------------
// Output Helper Functions
// -----------------------------------------------------------------------------

/// Writes to the session's stdout.
pub fn print(session: &Session, args: impl fmt::Display) {
    let _ = session.write(args.to_string().as_bytes());
}

/// Writes to the session's stdout with a newline.
pub fn println(session: &Session, args: impl fmt::Display) {
    let msg = format!("{}\r\n", args);
    let _ = session.write(msg.as_bytes());
}

/// Writes to the session's stderr.
pub fn error(session: &Session, args: impl fmt::Display) {
    let _ = session.write_stderr(args.to_string().as_bytes());
}

/// Writes to the session's stderr with a newline.
pub fn errorln(session: &Session, args: impl fmt::Display) {
    let msg = format!("{}\r\n", args);
    let _ = session.write_stderr(msg.as_bytes());
}

/// Writes to stderr and exits with status 1.
pub fn fatal(session: &Session, args: impl fmt::Display) {
    error(session, args);
    let _ = session.exit(1);
}

/// Writes to stderr with a newline and exits with status 1.
pub fn fatalln(session: &Session, args: impl fmt::Display) {
    errorln(session, args);
    let _ = session.exit(1);
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

/// A boxed future for async handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Session handler: runs once per shell, exec or subsystem request.
///
/// Returning ends the session with exit status 0 unless the handler already
/// called [`Session::exit`] or [`Session::close`].
pub type Handler = Arc<dyn Fn(Session) -> BoxFuture<'static, ()> + Send + Sync>;

/// Creates a handler from an async function.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// Creates a no-op handler.
pub fn noop_handler() -> Handler {
    Arc::new(|_| Box::pin(async {}))
}

/// Public key authentication handler.
pub type PublicKeyHandler = Arc<dyn Fn(&Context, &PublicKey) -> bool + Send + Sync>;

/// Password authentication handler.
pub type PasswordHandler = Arc<dyn Fn(&Context, &str) -> bool + Send + Sync>;

// -----------------------------------------------------------------------------
// Server Options
// -----------------------------------------------------------------------------

/// Options for configuring the SSH server.
#[derive(Clone)]
pub struct ServerOptions {
    /// Listen address.
    pub address: String,
    /// Server version string.
    pub version: String,
    /// Static banner shown before authentication.
    pub banner: Option<String>,
    /// Host key path.
    pub host_key_path: Option<String>,
    /// Host key PEM data.
    pub host_key_pem: Option<Vec<u8>>,
    /// Session handler.
    pub handler: Option<Handler>,
    /// Subsystem handlers, keyed by subsystem name.
    pub subsystem_handlers: HashMap<String, Handler>,
    /// Extra channel handlers, keyed by channel type. An entry for
    /// `"session"` replaces the built-in session handler.
    pub channel_handlers: HashMap<String, Arc<dyn ChannelHandler>>,
    /// Public key auth handler.
    pub public_key_handler: Option<PublicKeyHandler>,
    /// Password auth handler.
    pub password_handler: Option<PasswordHandler>,
    /// Idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Maximum authentication attempts before disconnection.
    pub max_auth_attempts: u32,
    /// Authentication rejection delay in milliseconds (timing attack mitigation).
    pub auth_rejection_delay_ms: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:22".to_string(),
            version: "SSH-2.0-Burrow".to_string(),
            banner: None,
            host_key_path: None,
            host_key_pem: None,
            handler: None,
            subsystem_handlers: HashMap::new(),
            channel_handlers: HashMap::new(),
            public_key_handler: None,
            password_handler: None,
            idle_timeout: None,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            auth_rejection_delay_ms: DEFAULT_AUTH_REJECTION_DELAY_MS,
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("address", &self.address)
            .field("version", &self.version)
            .field("banner", &self.banner)
            .field("host_key_path", &self.host_key_path)
            .field("idle_timeout", &self.idle_timeout)
            .field("channel_types", &self.channel_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Server
// -----------------------------------------------------------------------------

/// SSH server dispatching channels to registered handlers.
pub struct Server {
    /// Server options.
    options: ServerOptions,
    /// Current channel handlers; each connection takes a snapshot.
    channel_handlers: RwLock<ChannelHandlers>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .finish()
    }
}

impl Server {
    /// Creates a server. The `"session"` type is served by a
    /// [`SessionChannelHandler`] running the configured handler.
    pub fn new(options: ServerOptions) -> Self {
        let session_handler =
            SessionChannelHandler::new(options.handler.clone().unwrap_or_else(noop_handler))
                .with_subsystems(options.subsystem_handlers.clone());

        let mut handlers: HashMap<String, Arc<dyn ChannelHandler>> = HashMap::new();
        handlers.insert(SESSION.to_string(), Arc::new(session_handler));
        for (channel_type, handler) in &options.channel_handlers {
            handlers.insert(channel_type.clone(), Arc::clone(handler));
        }

        Self {
            options,
            channel_handlers: RwLock::new(Arc::new(handlers)),
        }
    }

    /// Returns the server options.
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Returns the listen address.
    pub fn address(&self) -> &str {
        &self.options.address
    }

    /// Registers a handler for a channel type, replacing any previous one.
    ///
    /// Connections already being served keep the handlers they started with.
    pub fn handle_channel(
        &self,
        channel_type: impl Into<String>,
        handler: impl ChannelHandler + 'static,
    ) {
        let mut current = self.channel_handlers.write();
        let mut handlers = (**current).clone();
        handlers.insert(channel_type.into(), Arc::new(handler));
        *current = Arc::new(handlers);
    }

    /// Returns the handlers a connection accepted now would use.
    pub fn channel_handlers(&self) -> ChannelHandlers {
        self.channel_handlers.read().clone()
    }

    /// Binds the configured address and serves connections on it.
    pub async fn listen(&self) -> Result<()> {
        info!("Starting SSH server on {}", self.options.address);

        let addr: SocketAddr = self.options.address.parse()?;
        debug!("Parsed address: {:?}", addr);

        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serves connections accepted from `listener`.
    ///
    /// Each connection runs in its own task, so a slow client never holds up
    /// the next accept. Returns only if the server configuration is invalid.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let config = Arc::new(self.create_russh_config()?);
        let state = Arc::new(ServerState::new(self.options.clone()));
        let fallback_addr = listener.local_addr()?;

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    info!(peer_addr = %peer_addr, "Accepted connection");

                    let config = Arc::clone(&config);
                    let local_addr = socket.local_addr().unwrap_or(fallback_addr);
                    let (link, incoming) = conn::link();
                    let handler =
                        ConnectionHandler::new(peer_addr, local_addr, Arc::clone(&state), link);
                    let connection_id = handler.connection_id();
                    let handlers = self.channel_handlers();

                    tokio::spawn(async move {
                        let transport = async move {
                            match run_stream(config, socket, handler).await {
                                Ok(session) => match session.await {
                                    Ok(()) => {
                                        debug!(connection_id, peer_addr = %peer_addr, "Connection closed cleanly");
                                    }
                                    Err(e) => {
                                        warn!(connection_id, peer_addr = %peer_addr, error = %e, "Connection error");
                                    }
                                },
                                Err(e) => {
                                    error!(connection_id, peer_addr = %peer_addr, error = %e, "SSH handshake failed");
                                }
                            }
                        };
                        let (_, served) = tokio::join!(transport, conn::serve(incoming, handlers));
                        if let Err(e) = served {
                            debug!(connection_id, peer_addr = %peer_addr, error = %e, "No channels served");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Creates the russh server configuration.
    fn create_russh_config(&self) -> Result<RusshConfig> {
        use russh::MethodSet;
        use russh::server::Config;
        use russh_keys::key::KeyPair;

        let mut config = Config::default();

        config.server_id = russh::SshId::Standard(self.options.version.clone());

        if let Some(timeout) = self.options.idle_timeout {
            config.inactivity_timeout = Some(timeout);
        }

        config.max_auth_attempts = self.options.max_auth_attempts as usize;
        config.auth_rejection_time = Duration::from_millis(self.options.auth_rejection_delay_ms);

        let mut methods = MethodSet::empty();
        if self.options.public_key_handler.is_some() {
            methods |= MethodSet::PUBLICKEY;
        }
        if self.options.password_handler.is_some() {
            methods |= MethodSet::PASSWORD;
        }
        if methods.is_empty() {
            methods |= MethodSet::NONE;
        }
        config.methods = methods;

        let key = if let Some(ref pem) = self.options.host_key_pem {
            russh_keys::decode_secret_key(
                std::str::from_utf8(pem).map_err(|e| Error::Key(e.to_string()))?,
                None,
            )?
        } else if let Some(ref path) = self.options.host_key_path {
            russh_keys::load_secret_key(path, None)?
        } else {
            info!("Generating ephemeral Ed25519 host key");
            KeyPair::generate_ed25519()
        };
        config.keys.push(key);

        if let Some(ref banner) = self.options.banner {
            // russh wants a &'static str; the server config lives for the
            // rest of the process.
            let banner: &'static str = Box::leak(banner.clone().into_boxed_str());
            config.auth_banner = Some(banner);
        }

        Ok(config)
    }
}

// -----------------------------------------------------------------------------
// Server Builder
// -----------------------------------------------------------------------------

/// Builder for creating an SSH server.
#[derive(Default)]
pub struct ServerBuilder {
    options: ServerOptions,
}

impl ServerBuilder {
    /// Creates a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.options.address = addr.into();
        self
    }

    /// Sets the server version string.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    /// Sets a static banner.
    pub fn banner(mut self, banner: impl Into<String>) -> Self {
        self.options.banner = Some(banner.into());
        self
    }

    /// Sets the host key path.
    pub fn host_key_path(mut self, path: impl Into<String>) -> Self {
        self.options.host_key_path = Some(path.into());
        self
    }

    /// Sets the host key from PEM data.
    pub fn host_key_pem(mut self, pem: Vec<u8>) -> Self {
        self.options.host_key_pem = Some(pem);
        self
    }

    /// Sets the session handler.
    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.options.handler = Some(crate::handler(handler));
        self
    }

    /// Sets an already boxed session handler.
    pub fn handler_arc(mut self, handler: Handler) -> Self {
        self.options.handler = Some(handler);
        self
    }

    /// Adds a subsystem handler.
    pub fn subsystem<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.options
            .subsystem_handlers
            .insert(name.into(), crate::handler(handler));
        self
    }

    /// Registers a handler for another channel type.
    pub fn channel_handler(
        mut self,
        channel_type: impl Into<String>,
        handler: impl ChannelHandler + 'static,
    ) -> Self {
        self.options
            .channel_handlers
            .insert(channel_type.into(), Arc::new(handler));
        self
    }

    /// Sets the public key authentication handler.
    pub fn public_key_auth<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Context, &PublicKey) -> bool + Send + Sync + 'static,
    {
        self.options.public_key_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the password authentication handler.
    pub fn password_auth<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Context, &str) -> bool + Send + Sync + 'static,
    {
        self.options.password_handler = Some(Arc::new(handler));
        self
    }

    /// Sets the maximum authentication attempts.
    pub fn max_auth_attempts(mut self, max: u32) -> Self {
        self.options.max_auth_attempts = max;
        self
    }

    /// Sets the authentication rejection delay in milliseconds.
    pub fn auth_rejection_delay(mut self, delay_ms: u64) -> Self {
        self.options.auth_rejection_delay_ms = delay_ms;
        self
    }

    /// Sets the idle timeout.
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.options.idle_timeout = Some(duration);
        self
    }

    /// Builds the server.
    pub fn build(self) -> Result<Server> {
        if self.options.host_key_pem.is_some() && self.options.host_key_path.is_some() {
            return Err(Error::Configuration(
                "set either a host key path or PEM data, not both".to_string(),
            ));
        }
        Ok(Server::new(self.options))
    }
}

// -----------------------------------------------------------------------------
// Prelude
// -----------------------------------------------------------------------------

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        ChannelHandler, Context, DirectTcpipHandler, Error, ExitError, Handler, Pty, PublicKey,
        Result, Server, ServerBuilder, ServerOptions, Session, Signal, Window, error, errorln,
        fatal, fatalln, handler, noop_handler, print, println,
    };
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

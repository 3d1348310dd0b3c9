#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Command as StdCommand, Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use burrow::channel::{ChannelOutput, Rejection, TransportChannel};
use burrow::conn::{self, Link};
use burrow::wire::{
    EnvPayload, ExecPayload, Payload, PtyRequestPayload, SignalPayload, SubsystemPayload,
    WindowChangePayload,
};
use burrow::{
    ChannelHandler, ChannelHandlers, Context, ExitError, Handler, SESSION, ServerBuilder,
    SessionChannelHandler, handler, println,
};
use tokio::net::TcpStream;
use tokio::process::Command as TokioCommand;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

pub const TEST_USER: &str = "testuser";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(20);

// -----------------------------------------------------------------------------
// In-memory connections
// -----------------------------------------------------------------------------

/// Routes library logs to the test harness; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn test_context() -> Context {
    let remote: SocketAddr = "127.0.0.1:50022".parse().expect("remote addr");
    let local: SocketAddr = "127.0.0.1:2222".parse().expect("local addr");
    Context::new(TEST_USER, remote, local).with_connection_id(1)
}

/// Handlers serving only `channel_type`.
pub fn registry(channel_type: &str, handler: impl ChannelHandler + 'static) -> ChannelHandlers {
    let mut handlers: HashMap<String, Arc<dyn ChannelHandler>> = HashMap::new();
    handlers.insert(channel_type.to_string(), Arc::new(handler));
    Arc::new(handlers)
}

/// An authenticated connection served in memory, without SSH framing.
pub struct TestConn {
    link: Link,
    served: JoinHandle<burrow::Result<()>>,
}

impl TestConn {
    pub fn with_handlers(handlers: ChannelHandlers) -> Self {
        init_tracing();
        let (mut link, incoming) = conn::link();
        let served = tokio::spawn(conn::serve(incoming, handlers));
        link.authenticate(test_context());
        Self { link, served }
    }

    /// A connection serving only sessions, each running `handler`.
    pub fn session(handler: Handler) -> Self {
        Self::with_handlers(registry(SESSION, SessionChannelHandler::new(handler)))
    }

    pub async fn open(
        &self,
        channel_type: &str,
        extra_data: Bytes,
    ) -> Result<TransportChannel, Rejection> {
        let opening = self
            .link
            .open_channel(channel_type, extra_data)
            .await
            .expect("connection is served");
        timeout(DEFAULT_TIMEOUT, opening.outcome())
            .await
            .expect("channel open timed out")
    }

    pub async fn open_session(&self) -> TestSession {
        let channel = self.open(SESSION, Bytes::new()).await.expect("session accepted");
        TestSession { channel }
    }

    /// Drops the transport side and waits for the dispatcher to finish.
    pub async fn shutdown(self) {
        drop(self.link);
        timeout(DEFAULT_TIMEOUT, self.served)
            .await
            .expect("dispatcher timed out")
            .expect("dispatcher panicked")
            .expect("dispatcher failed");
    }
}

/// The client's side of one session channel.
pub struct TestSession {
    channel: TransportChannel,
}

impl TestSession {
    pub async fn pty(&self, term: &str, width: u32, height: u32) -> bool {
        let payload = PtyRequestPayload {
            term: term.to_string(),
            width,
            height,
            ..Default::default()
        };
        self.channel.request("pty-req", payload.to_bytes(), true).await
    }

    pub async fn window_change(&self, width: u32, height: u32) -> bool {
        let payload = WindowChangePayload {
            width,
            height,
            ..Default::default()
        };
        self.channel
            .request("window-change", payload.to_bytes(), false)
            .await
    }

    pub async fn signal(&self, name: &str) -> bool {
        let payload = SignalPayload {
            name: name.to_string(),
        };
        self.channel.request("signal", payload.to_bytes(), false).await
    }

    pub async fn env(&self, name: &str, value: &str) -> bool {
        let payload = EnvPayload {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.channel.request("env", payload.to_bytes(), true).await
    }

    pub async fn shell(&self) -> bool {
        self.channel.request("shell", Bytes::new(), true).await
    }

    pub async fn exec(&self, command: &str) -> bool {
        let payload = ExecPayload {
            command: command.to_string(),
        };
        self.channel.request("exec", payload.to_bytes(), true).await
    }

    pub async fn subsystem(&self, name: &str) -> bool {
        let payload = SubsystemPayload {
            name: name.to_string(),
        };
        self.channel
            .request("subsystem", payload.to_bytes(), true)
            .await
    }

    pub async fn request(&self, request_type: &str, payload: Bytes, want_reply: bool) -> bool {
        self.channel.request(request_type, payload, want_reply).await
    }

    pub async fn send(&self, data: &[u8]) {
        self.channel
            .send_data(Bytes::copy_from_slice(data))
            .await
            .expect("session takes input");
    }

    pub fn eof(&mut self) {
        self.channel.send_eof();
    }

    pub async fn next_output(&mut self) -> Option<ChannelOutput> {
        timeout(DEFAULT_TIMEOUT, self.channel.recv_output())
            .await
            .expect("session output timed out")
    }

    /// Collects output until the channel closes.
    pub async fn wait(&mut self) -> Transcript {
        let mut transcript = Transcript::default();
        while let Some(message) = self.next_output().await {
            match message {
                ChannelOutput::Data(data) => transcript.stdout.extend_from_slice(&data),
                ChannelOutput::ExtendedData { data, .. } => {
                    transcript.stderr.extend_from_slice(&data)
                }
                ChannelOutput::Eof => transcript.eof = true,
                ChannelOutput::ExitStatus(status) => transcript.exit_status = Some(status),
                ChannelOutput::Close => {
                    transcript.closed = true;
                    break;
                }
            }
        }
        transcript
    }

    pub fn into_channel(self) -> TransportChannel {
        self.channel
    }
}

/// Everything a session sent before closing.
#[derive(Debug, Default)]
pub struct Transcript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
    pub eof: bool,
    pub closed: bool,
}

impl Transcript {
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// The exit outcome as a client running a command would report it.
    pub fn exit(&self) -> Result<(), ExitError> {
        ExitError::check(self.exit_status.expect("session sent an exit status"))
    }
}

/// Runs `handler` for one exec request and returns what the client saw.
pub async fn run_exec(handler: Handler, command: &str) -> Transcript {
    let conn = TestConn::session(handler);
    let mut session = conn.open_session().await;
    assert!(session.exec(command).await, "exec refused");
    let transcript = session.wait().await;
    conn.shutdown().await;
    transcript
}

// -----------------------------------------------------------------------------
// Real servers and the system ssh client
// -----------------------------------------------------------------------------

pub fn ssh_available() -> bool {
    StdCommand::new("ssh").arg("-V").output().is_ok()
}

pub fn ssh_keygen_available() -> bool {
    StdCommand::new("ssh-keygen").arg("-h").output().is_ok()
}

pub struct TestServer {
    port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(builder: ServerBuilder) -> Self {
        init_tracing();
        let port = pick_unused_port();
        let server = builder
            .address(format!("127.0.0.1:{port}"))
            .build()
            .expect("build burrow server");

        let handle = tokio::spawn(async move {
            if let Err(err) = server.listen().await {
                eprintln!("burrow server error: {err}");
            }
        });

        wait_for_port(port).await;

        Self { port, handle }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub fn pick_unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind temp port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    let addr = format!("127.0.0.1:{port}");
    for _ in 0..100 {
        if TcpStream::connect(&addr).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("burrow server did not start in time");
}

#[derive(Clone)]
pub struct SshClient {
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
}

impl SshClient {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            user: TEST_USER.to_string(),
            identity_file: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub async fn exec(&self, command: &str) -> io::Result<Output> {
        self.exec_with_options(
            command,
            &[
                "BatchMode=yes",
                "PreferredAuthentications=publickey,password,keyboard-interactive,none",
            ],
        )
        .await
    }

    pub async fn exec_with_options(
        &self,
        command: &str,
        extra_opts: &[&str],
    ) -> io::Result<Output> {
        let mut cmd = self.base_command();
        for opt in extra_opts {
            cmd.arg("-o").arg(opt);
        }
        cmd.arg(command);
        run_with_timeout(cmd, DEFAULT_TIMEOUT).await
    }

    /// Runs `command` with stdin fed from `input`.
    pub async fn exec_with_input(&self, command: &str, input: &[u8]) -> io::Result<Output> {
        use tokio::io::AsyncWriteExt;

        let mut cmd = self.base_command();
        cmd.arg("-o").arg("BatchMode=yes").arg(command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().expect("stdin");
        stdin.write_all(input).await?;
        drop(stdin);

        timeout(DEFAULT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ssh command timed out"))?
    }

    pub async fn exec_with_password(&self, command: &str, password: &str) -> io::Result<Output> {
        let dir = tempfile::tempdir()?;
        let script_path = dir.path().join("askpass.sh");
        let script = "#!/bin/sh\nprintf '%s\\n' \"$BURROW_TEST_PASSWORD\"\n";
        std::fs::write(&script_path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(&script_path, perms)?;
        }

        let mut cmd = self.base_command();
        cmd.arg("-o")
            .arg("BatchMode=no")
            .arg("-o")
            .arg("PreferredAuthentications=password")
            .arg("-o")
            .arg("PubkeyAuthentication=no")
            .arg("-o")
            .arg("NumberOfPasswordPrompts=1")
            .env("SSH_ASKPASS", &script_path)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env("DISPLAY", "1")
            .env("BURROW_TEST_PASSWORD", password)
            .arg(command);

        run_with_timeout(cmd, DEFAULT_TIMEOUT).await
    }

    /// Opens a `direct-tcpip` tunnel to `target` with stdio forwarding.
    pub fn spawn_tunnel(&self, target: &str) -> io::Result<tokio::process::Child> {
        let mut cmd = self.base_command();
        cmd.arg("-o").arg("BatchMode=yes").arg("-W").arg(target);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn()
    }

    pub fn spawn_interactive(&self) -> io::Result<tokio::process::Child> {
        let mut cmd = self.base_command();
        cmd.arg("-tt").arg("-o").arg("BatchMode=yes");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn()
    }

    fn base_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new("ssh");
        cmd.arg("-F")
            .arg("/dev/null")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("GlobalKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg("ConnectTimeout=5")
            .arg("-p")
            .arg(self.port.to_string());

        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
            cmd.arg("-o").arg("IdentitiesOnly=yes");
            cmd.arg("-o").arg("IdentityAgent=none");
        }

        cmd.arg(format!("{}@127.0.0.1", self.user));
        cmd
    }
}

async fn run_with_timeout(mut cmd: TokioCommand, timeout_duration: Duration) -> io::Result<Output> {
    cmd.stdin(Stdio::null());
    let output = timeout(timeout_duration, cmd.output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ssh command timed out"))??;
    Ok(output)
}

pub async fn read_until_contains<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    needle: &str,
    timeout_duration: Duration,
) -> io::Result<String> {
    use tokio::io::AsyncReadExt;

    let mut buffer = Vec::new();
    let mut scratch = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + timeout_duration;

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timeout waiting for output: {needle}"),
            ));
        }

        let read = match timeout(deadline - now, reader.read(&mut scratch)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timeout waiting for output: {needle}"),
                ));
            }
        };

        buffer.extend_from_slice(&scratch[..read]);
        let text = String::from_utf8_lossy(&buffer);
        if text.contains(needle) {
            return Ok(text.into_owned());
        }
    }

    Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("output ended before finding: {needle}"),
    ))
}

pub fn handler_with_message(message: impl Into<String>) -> Handler {
    let message = message.into();
    handler(move |session| {
        let message = message.clone();
        async move {
            println(&session, &message);
        }
    })
}

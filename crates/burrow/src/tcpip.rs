//! `direct-tcpip` channels: client-requested tunnels to TCP targets.
//!
//! [`DirectTcpipHandler`] dials the target named in the channel-open data and
//! relays bytes both ways with [`bridge`]. It is not registered by default;
//! add it with [`ServerBuilder::channel_handler`](crate::ServerBuilder::channel_handler)
//! or [`Server::handle_channel`](crate::Server::handle_channel).

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::channel::{Channel, NewChannel, RejectReason};
use crate::conn::ChannelHandler;
use crate::wire::{DirectTcpipPayload, Payload};
use crate::{Context, Error, Result};

/// Channel type served by [`DirectTcpipHandler`].
pub const DIRECT_TCPIP: &str = "direct-tcpip";

/// Channel type of server-to-client forwarded connections. Its open data has
/// the same layout as `direct-tcpip`.
pub const FORWARDED_TCPIP: &str = "forwarded-tcpip";

/// How long a tunnel waits for its target to accept the connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

const COPY_BUFFER: usize = 32 * 1024;

/// Dials the requested target and bridges the channel to it.
#[derive(Debug, Clone, Copy)]
pub struct DirectTcpipHandler {
    dial_timeout: Duration,
}

impl Default for DirectTcpipHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectTcpipHandler {
    /// Creates the handler with [`DEFAULT_DIAL_TIMEOUT`].
    pub fn new() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    /// Sets how long to wait for the target before refusing the channel.
    ///
    /// The channel open is answered only after the dial, and the SSH
    /// connection handles nothing else meanwhile.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match timeout(self.dial_timeout, TcpStream::connect((host, port))).await {
            Ok(connected) => connected,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer within {:?}", self.dial_timeout),
            )),
        }
    }
}

#[async_trait]
impl ChannelHandler for DirectTcpipHandler {
    async fn handle(&self, ctx: Context, new_channel: NewChannel) {
        let connection_id = ctx.connection_id();
        let request = match DirectTcpipPayload::from_bytes(new_channel.extra_data()) {
            Ok(request) => request,
            Err(err) => {
                let err = Error::from(err);
                warn!(connection_id, error = %err, "rejecting direct-tcpip channel");
                new_channel.reject(RejectReason::ConnectFailed, err.to_string());
                return;
            }
        };

        let target = format!("{}:{}", request.host, request.port);
        let Ok(port) = u16::try_from(request.port) else {
            warn!(connection_id, target = %target, "rejecting direct-tcpip channel: port out of range");
            new_channel.reject(RejectReason::ConnectFailed, "port out of range");
            return;
        };

        debug!(
            connection_id,
            target = %target,
            originator = %format_args!("{}:{}", request.originator_host, request.originator_port),
            "dialing direct-tcpip target"
        );
        let stream = match self.dial(&request.host, port).await {
            Ok(stream) => stream,
            Err(source) => {
                let err = Error::Dial { target, source };
                warn!(connection_id, error = %err, "rejecting direct-tcpip channel");
                new_channel.reject(RejectReason::ConnectFailed, err.to_string());
                return;
            }
        };

        // Tunnels take no requests; dropping the stream answers each with
        // failure.
        let (channel, requests) = new_channel.accept();
        drop(requests);

        match bridge(channel, stream).await {
            Ok((sent, received)) => {
                debug!(connection_id, target = %target, sent, received, "direct-tcpip tunnel finished");
            }
            Err(err) => {
                debug!(connection_id, target = %target, error = %err, "direct-tcpip tunnel failed");
            }
        }
    }
}

/// Relays bytes between `channel` and `stream` until both directions end.
///
/// When one direction reaches end of stream, its destination is half-closed
/// (the stream is shut down for writing, or EOF is sent on the channel) and
/// the other direction keeps running. An error in either direction, or the
/// peer going away, ends both at once. The channel is closed on return and
/// the stream dropped.
///
/// Returns the number of bytes sent to the stream and received from it.
pub async fn bridge<S>(channel: Channel, stream: S) -> Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut input, writer) = channel.split();
    let (mut target_read, mut target_write) = tokio::io::split(stream);

    let upstream = async {
        let mut sent = 0u64;
        while let Some(chunk) = input.recv().await {
            target_write.write_all(&chunk).await?;
            sent += chunk.len() as u64;
        }
        target_write.shutdown().await?;
        Ok::<u64, Error>(sent)
    };

    let downstream = async {
        let mut received = 0u64;
        let mut buf = BytesMut::with_capacity(COPY_BUFFER);
        loop {
            buf.reserve(COPY_BUFFER);
            let n = tokio::select! {
                read = target_read.read_buf(&mut buf) => read?,
                () = writer.hung_up() => return Err(Error::PeerHangup),
            };
            if n == 0 {
                break;
            }
            received += n as u64;
            // Waits while the peer is behind, which stops reads from the
            // target.
            writer.data(buf.split().freeze()).await?;
        }
        writer.eof()?;
        Ok::<u64, Error>(received)
    };

    tokio::pin!(upstream, downstream);
    let result = tokio::select! {
        sent = &mut upstream => match sent {
            Ok(sent) => (&mut downstream).await.map(|received| (sent, received)),
            Err(err) => Err(err),
        },
        received = &mut downstream => match received {
            Ok(received) => (&mut upstream).await.map(|sent| (sent, received)),
            Err(err) => Err(err),
        },
    };

    let _ = writer.close();
    result
}

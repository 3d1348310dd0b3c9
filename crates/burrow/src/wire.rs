//! Typed payloads of channel requests and channel-open data.
//!
//! Everything here uses the SSH wire encoding from RFC 4251 §5: `uint32`
//! is four big-endian bytes and `string` is a `uint32` length followed by
//! that many bytes. Decoding ignores trailing bytes so that peers sending
//! extensions we do not understand are still served.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Failure to decode a request payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The payload ended before a required field.
    #[error("payload truncated while reading {0}")]
    Truncated(&'static str),

    /// A string field was not valid UTF-8.
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),
}

/// A value with an SSH wire representation.
pub trait Payload: Sized {
    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Reads a value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self, WireError>;

    /// Encodes the value into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a value from a complete payload.
    fn from_bytes(payload: &[u8]) -> Result<Self, WireError> {
        let mut buf = Bytes::copy_from_slice(payload);
        Self::decode(&mut buf)
    }
}

fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    let len = get_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let raw = get_bytes(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

/// Opcode terminating an encoded terminal-modes list.
const TTY_OP_END: u8 = 0;

/// Opcodes 160 and above carry no defined argument; a well-formed list
/// stops before them.
const TTY_OP_LAST_WITH_ARG: u8 = 159;

fn encode_modes(modes: &[(u8, u32)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(modes.len() * 5 + 1);
    for &(opcode, value) in modes {
        if opcode == TTY_OP_END {
            continue;
        }
        buf.put_u8(opcode);
        buf.put_u32(value);
    }
    buf.put_u8(TTY_OP_END);
    buf.freeze()
}

fn decode_modes(mut raw: Bytes) -> Vec<(u8, u32)> {
    let mut modes = Vec::new();
    while raw.remaining() >= 5 {
        let opcode = raw.get_u8();
        if opcode == TTY_OP_END || opcode > TTY_OP_LAST_WITH_ARG {
            break;
        }
        modes.push((opcode, raw.get_u32()));
    }
    modes
}

/// `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PtyRequestPayload {
    pub term: String,
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Terminal modes as `(opcode, value)` pairs.
    pub modes: Vec<(u8, u32)>,
}

impl Payload for PtyRequestPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.term);
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.pixel_width);
        buf.put_u32(self.pixel_height);
        put_bytes(buf, &encode_modes(&self.modes));
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let term = get_string(buf, "term")?;
        let width = get_u32(buf, "width")?;
        let height = get_u32(buf, "height")?;
        // Pixel sizes and modes are optional in practice.
        let pixel_width = get_u32(buf, "pixel width").unwrap_or(0);
        let pixel_height = get_u32(buf, "pixel height").unwrap_or(0);
        let modes = get_bytes(buf, "modes").map(decode_modes).unwrap_or_default();
        Ok(Self {
            term,
            width,
            height,
            pixel_width,
            pixel_height,
            modes,
        })
    }
}

/// `window-change` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowChangePayload {
    pub width: u32,
    pub height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl Payload for WindowChangePayload {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.width);
        buf.put_u32(self.height);
        buf.put_u32(self.pixel_width);
        buf.put_u32(self.pixel_height);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let width = get_u32(buf, "width")?;
        let height = get_u32(buf, "height")?;
        Ok(Self {
            width,
            height,
            pixel_width: get_u32(buf, "pixel width").unwrap_or(0),
            pixel_height: get_u32(buf, "pixel height").unwrap_or(0),
        })
    }
}

/// `signal` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalPayload {
    pub name: String,
}

impl Payload for SignalPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            name: get_string(buf, "signal name")?,
        })
    }
}

/// `exec` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPayload {
    pub command: String,
}

impl Payload for ExecPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.command);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            command: get_string(buf, "command")?,
        })
    }
}

/// `subsystem` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemPayload {
    pub name: String,
}

impl Payload for SubsystemPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            name: get_string(buf, "subsystem name")?,
        })
    }
}

/// `env` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPayload {
    pub name: String,
    pub value: String,
}

impl Payload for EnvPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        put_string(buf, &self.value);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            name: get_string(buf, "variable name")?,
            value: get_string(buf, "variable value")?,
        })
    }
}

/// Extra data of a `direct-tcpip` or `forwarded-tcpip` channel open.
///
/// For `forwarded-tcpip`, `host` and `port` are the address that was
/// connected rather than the one to dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTcpipPayload {
    pub host: String,
    pub port: u32,
    pub originator_host: String,
    pub originator_port: u32,
}

impl Payload for DirectTcpipPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.host);
        buf.put_u32(self.port);
        put_string(buf, &self.originator_host);
        buf.put_u32(self.originator_port);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            host: get_string(buf, "host")?,
            port: get_u32(buf, "port")?,
            originator_host: get_string(buf, "originator host")?,
            originator_port: get_u32(buf, "originator port")?,
        })
    }
}

/// Extra data of an `x11` channel open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Payload {
    pub originator_host: String,
    pub originator_port: u32,
}

impl Payload for X11Payload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.originator_host);
        buf.put_u32(self.originator_port);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            originator_host: get_string(buf, "originator host")?,
            originator_port: get_u32(buf, "originator port")?,
        })
    }
}

/// `tcpip-forward` and `cancel-tcpip-forward` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipForwardPayload {
    pub address: String,
    pub port: u32,
}

impl Payload for TcpipForwardPayload {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.address);
        buf.put_u32(self.port);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            address: get_string(buf, "bind address")?,
            port: get_u32(buf, "bind port")?,
        })
    }
}

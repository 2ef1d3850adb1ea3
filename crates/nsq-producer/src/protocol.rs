//! Wire framing for the broker protocol.

use crate::command::Command;
use crate::config::Config;

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Sent once after dialing to select protocol version 2.
pub const MAGIC_V2: &[u8] = b"  V2";

/// Data of the response frame the broker sends as a heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Data of a plain acknowledgement.
pub const OK: &[u8] = b"OK";

/// Largest inbound frame accepted (size field included).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size prefix plus frame type.
const FRAME_HEADER_SIZE: usize = 8;

/// Type of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    /// Successful response to a command (or a heartbeat).
    Response = 0,
    /// Error response to a command.
    Error = 1,
    /// Message delivery; only subscribers receive these.
    Message = 2,
}

impl TryFrom<i32> for FrameType {
    type Error = io::Error;

    fn try_from(value: i32) -> Result<Self, io::Error> {
        match value {
            0 => Ok(Self::Response),
            1 => Ok(Self::Error),
            2 => Ok(Self::Message),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type {value}"),
            )),
        }
    }
}

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Type of this frame.
    pub frame_type: FrameType,
    /// Frame data.
    pub data: Bytes,
}

impl Frame {
    /// Whether this is a heartbeat rather than a command response.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Response && self.data.as_ref() == HEARTBEAT
    }
}

/// Codec decoding inbound frames and encoding outbound commands.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default frame size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom frame size limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let size = header.get_u32() as usize;
        let frame_type = header.get_i32();

        if size < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {size} smaller than its type field"),
            ));
        }
        if size > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {size} exceeds maximum {}", self.max_frame_size),
            ));
        }

        let frame_len = 4 + size;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame_type = FrameType::try_from(frame_type)?;

        buf.advance(FRAME_HEADER_SIZE);
        let data = buf.split_to(size - 4).freeze();

        Ok(Some(Frame { frame_type, data }))
    }
}

impl Encoder<&Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: &Command, buf: &mut BytesMut) -> Result<(), Self::Error> {
        command.write_to(buf)
    }
}

/// Body of the `IDENTIFY` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyRequest {
    /// Client identifier.
    pub client_id: String,
    /// Client hostname.
    pub hostname: String,
    /// Client user agent.
    pub user_agent: String,
    /// Always true; asks the broker for a JSON reply.
    pub feature_negotiation: bool,
    /// Heartbeat interval in milliseconds, `-1` to disable.
    pub heartbeat_interval: i64,
    /// Output buffer size in bytes.
    pub output_buffer_size: i64,
    /// Output buffer timeout in milliseconds.
    pub output_buffer_timeout: i64,
    /// Message timeout in milliseconds, `0` for the broker default.
    pub msg_timeout: i64,
    /// Sample rate percentage.
    pub sample_rate: u8,
    /// TLS is never negotiated.
    pub tls_v1: bool,
    /// Deflate is never negotiated.
    pub deflate: bool,
    /// Snappy is never negotiated.
    pub snappy: bool,
}

impl IdentifyRequest {
    /// Build the request announced for `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let heartbeat_interval = if config.heartbeat_interval.is_zero() {
            -1
        } else {
            millis(config.heartbeat_interval)
        };

        Self {
            client_id: config.client_id.clone(),
            hostname: config.hostname.clone(),
            user_agent: config.user_agent.clone(),
            feature_negotiation: true,
            heartbeat_interval,
            output_buffer_size: config.output_buffer_size,
            output_buffer_timeout: millis(config.output_buffer_timeout),
            msg_timeout: millis(config.msg_timeout),
            sample_rate: config.sample_rate,
            tls_v1: false,
            deflate: false,
            snappy: false,
        }
    }
}

/// Settings negotiated by the broker in reply to `IDENTIFY`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdentifyResponse {
    /// Broker version.
    pub version: String,
    /// Largest RDY count the broker accepts.
    pub max_rdy_count: i64,
    /// Largest message timeout the broker accepts, in milliseconds.
    pub max_msg_timeout: i64,
    /// Effective message timeout, in milliseconds.
    pub msg_timeout: i64,
    /// Whether TLS was enabled.
    pub tls_v1: bool,
    /// Whether deflate was enabled.
    pub deflate: bool,
    /// Whether snappy was enabled.
    pub snappy: bool,
    /// Whether the client must send `AUTH` before anything else.
    pub auth_required: bool,
}

/// Reply to `AUTH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    /// Identity the secret resolved to.
    pub identity: String,
    /// Link describing the identity.
    pub identity_url: String,
    /// Number of granted permissions.
    pub permission_count: i64,
}

fn millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

//! Tunnel message envelope carried inside ICMP echo payloads.
//!
//! Every echo exchanged between client and server wraps one
//! [`TunnelMessage`]: the demultiplexing key, the tunnel id, and either a
//! liveness ping or a data payload. In stream (TCP) mode the payload is an
//! encoded [`Frame`](super::frame::Frame); in datagram (UDP) mode it is the
//! raw datagram.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_RESEND_TIMEOUT, DEFAULT_WINDOW_SIZE};

/// What a tunnel message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Liveness probe; the server echoes it straight back.
    Ping,
    /// Tunneled payload for the session named by `tunnel_id`.
    Data,
}

/// Stream-mode session parameters, carried on every stream-mode message so
/// the server can construct the session from whichever packet arrives first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Byte queue capacity for each direction.
    pub buffer_size: u32,
    /// Bound on unacknowledged DATA frames in flight.
    pub window_size: u32,
    /// Retransmission timeout in milliseconds.
    pub resend_timeout_ms: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE as u32,
            window_size: DEFAULT_WINDOW_SIZE as u32,
            resend_timeout_ms: DEFAULT_RESEND_TIMEOUT.as_millis() as u32,
        }
    }
}

/// The envelope inside every echo payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    /// Shared demultiplexing token. Not a MAC: it only keeps unrelated
    /// traffic and scanners out of the connection table.
    pub key: u32,
    /// Tunnel session identifier, chosen by the client.
    pub tunnel_id: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Upstream address the server should relay to, as `host:port`.
    pub target: String,
    /// Encoded frame (stream mode) or raw datagram (datagram mode).
    pub payload: Vec<u8>,
    /// ICMP echo type the peer should use for replies.
    pub reply_type: u8,
    /// Present iff the session tunnels a TCP stream.
    pub stream: Option<StreamParams>,
}

impl TunnelMessage {
    /// Encode into the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        bincode::serialize(self).map_err(|e| PacketError::Encode(e.to_string()))
    }

    /// Decode from the wire representation.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        bincode::deserialize(data).map_err(|e| PacketError::Decode(e.to_string()))
    }

    /// Whether this message belongs to a stream-mode session.
    pub fn is_stream(&self) -> bool {
        self.stream.is_some()
    }
}

/// Errors from the tunnel message codec.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Serialization failed.
    #[error("tunnel message encode failed: {0}")]
    Encode(String),

    /// Input was not a well-formed tunnel message.
    #[error("tunnel message decode failed: {0}")]
    Decode(String),
}

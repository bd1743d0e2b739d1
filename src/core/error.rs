//! Top-level error type for the tunnel.

use thiserror::Error;

use crate::transport::buffer::BufferError;
use crate::transport::frame::FrameError;
use crate::transport::packet::PacketError;

/// Errors surfaced by the tunnel as a whole.
///
/// Layer-specific errors live next to the layer that produces them; this
/// enum aggregates them for callers that drive a whole endpoint.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Byte queue misuse (overflow or underflow).
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Frame wire codec failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Tunnel message wire codec failure.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// I/O error from the carrier socket or an upstream connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

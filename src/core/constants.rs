//! Protocol constants.
//!
//! Frame sizing and identifier limits are wire-visible: both tunnel ends must
//! agree on them. Timing values are per-side defaults and may be overridden
//! through configuration.

use std::time::Duration;

// =============================================================================
// FRAME LAYER
// =============================================================================

/// Maximum payload bytes carried by one DATA frame.
///
/// Sized so that a frame, after the tunnel message envelope and the ICMP echo
/// header are added, still fits a conservative path MTU.
pub const FRAME_MAX_SIZE: usize = 888;

/// Largest legal frame identifier; the identifier after this wraps to 0.
pub const FRAME_MAX_ID: u32 = 1_000_000;

// =============================================================================
// STREAM LAYER DEFAULTS
// =============================================================================

/// Default capacity of the send and receive byte queues.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default bound on unacknowledged DATA frames in flight.
pub const DEFAULT_WINDOW_SIZE: usize = 10_000;

/// Default elapsed time after which an unacknowledged frame is retransmitted.
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_millis(400);

// =============================================================================
// SERVER DEFAULTS
// =============================================================================

/// Default idle time after which a tunnel session is reclaimed.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between timeout sweeps and throughput reports.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Read chunk size for upstream TCP relaying.
pub const UPSTREAM_READ_CHUNK: usize = 10 * 1024;

/// Receive buffer size for the ICMP socket.
pub const ICMP_RECV_BUFFER_SIZE: usize = 65_535;

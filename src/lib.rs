//! # echotun
//!
//! Tunnels TCP and UDP traffic through ICMP Echo Request/Reply packets,
//! for networks that filter transport protocols but let ping through.
//!
//! Echo delivery is unreliable and unordered, while a tunneled TCP session
//! needs a lossless ordered byte stream. The heart of the crate is the
//! [`FrameManager`](transport::FrameManager): a sliding-window reliable
//! stream multiplexer that chunks outbound bytes into numbered frames,
//! retransmits on timeout or peer request, acknowledges everything it
//! receives, and reassembles the inbound frames in order. One manager runs
//! per tunneled TCP session on each side of the tunnel.
//!
//! ## Modules
//!
//! - [`core`]: constants and the top-level error type
//! - [`transport`]: byte queues, frames, the stream multiplexer, and the
//!   ICMP carrier codec and socket
//! - [`server`]: the connection table, timeout sweeper, and per-session
//!   relay tasks
//!
//! ## Example
//!
//! Driving a stream multiplexer by hand:
//!
//! ```rust
//! use std::time::Duration;
//! use echotun::transport::FrameManager;
//!
//! let mut fm = FrameManager::new(64 * 1024, 100, Duration::from_millis(400));
//!
//! fm.write_send(b"hello across the tunnel").unwrap();
//! fm.update();
//! for frame in fm.drain_outgoing() {
//!     // hand each frame to the carrier
//!     let _ = frame.encode().unwrap();
//! }
//! ```
//!
//! Running a server (requires CAP_NET_RAW):
//!
//! ```no_run
//! use echotun::server::{ServerConfig, TunnelServer};
//!
//! # async fn run() -> Result<(), echotun::server::ServerError> {
//! let config = ServerConfig::default().with_key(0xC0FFEE);
//! let mut server = TunnelServer::new(config)?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod core;
pub mod server;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::constants::*;
    pub use crate::core::TunnelError;
    pub use crate::server::{ServerConfig, TunnelServer};
    pub use crate::transport::{Frame, FrameManager, IngestQueue, TunnelMessage};
}

pub use crate::core::TunnelError;
pub use crate::transport::{Frame, FrameManager};

//! Server side of the tunnel: the connection table and per-session relays.

pub mod server;
pub mod session;

pub use server::{ServerConfig, ServerError, ServerStats, StatsReport, TunnelServer};
pub use session::{EchoIds, ServerSession, SessionRoute};

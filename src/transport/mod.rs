//! Transport layer: byte queues, frames, the stream multiplexer, and the
//! ICMP carrier.

pub mod buffer;
pub mod frame;
pub mod icmp;
pub mod manager;
pub mod packet;
pub mod socket;

pub use buffer::{BufferError, ByteRing};
pub use frame::{Frame, FrameError};
pub use icmp::{IcmpEcho, ECHO_REPLY, ECHO_REQUEST};
pub use manager::{FrameManager, IngestQueue};
pub use packet::{MessageKind, PacketError, StreamParams, TunnelMessage};
pub use socket::IcmpSocket;

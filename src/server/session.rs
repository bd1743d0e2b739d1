//! Per-tunnel session state held in the server's connection table.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::manager::IngestQueue;

/// Echo identifiers last seen from the client, mirrored into replies so the
/// tunnel looks like ordinary ping traffic to middleboxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoIds {
    /// ICMP echo identifier.
    pub ident: u16,
    /// ICMP echo sequence number.
    pub seq: u16,
}

/// Where a session's inbound payloads are routed.
#[derive(Debug)]
pub enum SessionRoute {
    /// Stream mode: decoded frames feed the relay task's stream multiplexer.
    Stream(IngestQueue),
    /// Datagram mode: raw payloads feed the relay task's UDP socket.
    Datagram(mpsc::Sender<Vec<u8>>),
}

/// One tunneled connection tracked by the server.
#[derive(Debug)]
pub struct ServerSession {
    tunnel_id: String,
    peer: Ipv4Addr,
    target: String,
    /// ICMP echo type the client wants replies sent as.
    reply_type: u8,
    route: SessionRoute,
    /// Shared with the relay task, which stamps replies with the freshest ids.
    echo: Arc<Mutex<EchoIds>>,
    /// Set by the relay task when its upstream connection ends.
    closed: Arc<AtomicBool>,
    last_active: Instant,
}

impl ServerSession {
    /// Track a new session.
    pub fn new(
        tunnel_id: String,
        peer: Ipv4Addr,
        target: String,
        reply_type: u8,
        route: SessionRoute,
        echo: Arc<Mutex<EchoIds>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tunnel_id,
            peer,
            target,
            reply_type,
            route,
            echo,
            closed,
            last_active: Instant::now(),
        }
    }

    /// The session identifier chosen by the client.
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// The client's address.
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    /// The upstream address this session relays to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The ICMP echo type used for replies to this client.
    pub fn reply_type(&self) -> u8 {
        self.reply_type
    }

    /// Inbound payload route.
    pub fn route(&self) -> &SessionRoute {
        &self.route
    }

    /// Record client activity and the echo identifiers to mirror.
    pub fn touch(&mut self, ids: EchoIds) {
        self.last_active = Instant::now();
        *self.echo.lock() = ids;
    }

    /// Time since the client's last packet.
    pub fn idle_time(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Whether the relay task has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the session closed; the relay task observes this through its
    /// channel or queue being dropped along with the session.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

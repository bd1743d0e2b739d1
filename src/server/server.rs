//! Tunnel server: accepts echo-borne tunnel messages, relays them to their
//! upstream targets, and returns traffic as echo replies.
//!
//! One task owns the connection table and processes decoded arrivals; a
//! receive task feeds it from the ICMP socket; each session runs its own
//! relay task. Stream-mode sessions carry a [`FrameManager`] between the
//! lossy echo carrier and the upstream TCP connection; datagram-mode
//! sessions relay raw payloads to a UDP socket.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time;

use super::session::{EchoIds, ServerSession, SessionRoute};
use crate::core::constants::{
    DEFAULT_SESSION_TIMEOUT, ICMP_RECV_BUFFER_SIZE, SWEEP_INTERVAL, UPSTREAM_READ_CHUNK,
};
use crate::transport::frame::Frame;
use crate::transport::icmp::{build_echo, parse_echo, ECHO_REPLY, ECHO_REQUEST};
use crate::transport::manager::FrameManager;
use crate::transport::packet::{MessageKind, TunnelMessage};
use crate::transport::socket::IcmpSocket;

/// Errors that can stop the tunnel server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Opening the raw ICMP socket failed (usually missing CAP_NET_RAW).
    #[error("opening the icmp socket failed: {0}")]
    Socket(#[from] io::Error),

    /// The ICMP receive task stopped unexpectedly.
    #[error("the icmp receive task stopped")]
    ReceiverStopped,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Shared demultiplexing key; packets carrying any other key are dropped.
    pub key: u32,
    /// Idle time after which a datagram session is reclaimed.
    pub session_timeout: Duration,
    /// Interval between timeout sweeps and throughput reports.
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            key: 0,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Set the demultiplexing key.
    pub fn with_key(mut self, key: u32) -> Self {
        self.key = key;
        self
    }

    /// Set the idle timeout for datagram sessions.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

/// Packet and byte counters, reset on every report.
#[derive(Debug, Default)]
pub struct ServerStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_recv: AtomicU64,
    bytes_recv: AtomicU64,
}

impl ServerStats {
    /// Count one tunneled payload sent to a client.
    pub fn record_sent(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Count one tunneled payload received from a client.
    pub fn record_recv(&self, len: usize) {
        self.packets_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Take the counters since the last report, resetting them.
    pub fn take_report(&self) -> StatsReport {
        StatsReport {
            packets_sent: self.packets_sent.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            packets_recv: self.packets_recv.swap(0, Ordering::Relaxed),
            bytes_recv: self.bytes_recv.swap(0, Ordering::Relaxed),
        }
    }
}

/// One reporting interval's worth of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsReport {
    /// Payloads sent to clients.
    pub packets_sent: u64,
    /// Payload bytes sent to clients.
    pub bytes_sent: u64,
    /// Payloads received from clients.
    pub packets_recv: u64,
    /// Payload bytes received from clients.
    pub bytes_recv: u64,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "send {}pkt/s {}KB/s recv {}pkt/s {}KB/s",
            self.packets_sent,
            self.bytes_sent / 1024,
            self.packets_recv,
            self.bytes_recv / 1024
        )
    }
}

/// A decoded tunnel message together with its echo envelope metadata.
#[derive(Debug)]
struct Arrival {
    msg: TunnelMessage,
    peer: Ipv4Addr,
    ids: EchoIds,
}

/// Everything a relay task needs to answer its client.
#[derive(Clone)]
struct ReplyContext {
    socket: Arc<IcmpSocket>,
    peer: Ipv4Addr,
    key: u32,
    tunnel_id: String,
    /// Echo type the client asked replies to use.
    echo_type: u8,
    echo: Arc<Mutex<EchoIds>>,
    stats: Arc<ServerStats>,
}

impl ReplyContext {
    /// Wrap a payload in the tunnel envelope and send it as an echo.
    async fn send_data(&self, payload: Vec<u8>) {
        let sent_len = payload.len();
        let msg = TunnelMessage {
            key: self.key,
            tunnel_id: self.tunnel_id.clone(),
            kind: MessageKind::Data,
            target: String::new(),
            payload,
            reply_type: ECHO_REPLY,
            stream: None,
        };
        let wire = match msg.encode() {
            Ok(wire) => wire,
            Err(e) => {
                error!("encoding reply for {} failed: {}", self.tunnel_id, e);
                return;
            }
        };

        let ids = *self.echo.lock();
        let packet = build_echo(self.echo_type, ids.ident, ids.seq, &wire);
        match self.socket.send_to(&packet, self.peer).await {
            Ok(_) => self.stats.record_sent(sent_len),
            Err(e) => warn!("echo send to {} failed: {}", self.peer, e),
        }
    }
}

/// The tunnel server.
pub struct TunnelServer {
    config: ServerConfig,
    socket: Arc<IcmpSocket>,
    sessions: HashMap<String, ServerSession>,
    stats: Arc<ServerStats>,
}

impl TunnelServer {
    /// Open the ICMP socket and prepare an empty connection table.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Ok(Self::with_socket(config, IcmpSocket::new()?))
    }

    /// Build a server around an already-opened carrier socket.
    ///
    /// Lets a privileged launcher open the raw socket before dropping
    /// capabilities and hand the server a ready carrier.
    pub fn with_socket(config: ServerConfig, socket: IcmpSocket) -> Self {
        Self {
            config,
            socket: Arc::new(socket),
            sessions: HashMap::new(),
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Number of tracked sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the server until the receive task stops.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        let (tx, mut rx) = mpsc::channel(10_000);
        tokio::spawn(recv_echoes(self.socket.clone(), tx));

        let mut sweep = time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    sweep_sessions(&mut self.sessions, self.config.session_timeout);
                    info!("{}", self.stats.take_report());
                }
                arrival = rx.recv() => match arrival {
                    Some(arrival) => self.process(arrival).await,
                    None => return Err(ServerError::ReceiverStopped),
                },
            }
        }
    }

    async fn process(&mut self, arrival: Arrival) {
        let Arrival { msg, peer, ids } = arrival;

        if msg.key != self.config.key {
            debug!("dropping packet from {} with wrong key", peer);
            return;
        }
        self.stats.record_recv(msg.payload.len());

        match msg.kind {
            MessageKind::Ping => self.answer_ping(msg, peer, ids).await,
            MessageKind::Data => self.relay_data(msg, peer, ids).await,
        }
    }

    /// Echo a liveness probe straight back to the client.
    async fn answer_ping(&self, msg: TunnelMessage, peer: Ipv4Addr, ids: EchoIds) {
        info!("ping from {} ({} bytes)", peer, msg.payload.len());

        let echo_type = msg.reply_type;
        let reply = TunnelMessage {
            key: self.config.key,
            kind: MessageKind::Ping,
            target: String::new(),
            reply_type: ECHO_REPLY,
            stream: None,
            ..msg
        };
        let wire = match reply.encode() {
            Ok(wire) => wire,
            Err(e) => {
                error!("encoding ping reply failed: {}", e);
                return;
            }
        };
        let packet = build_echo(echo_type, ids.ident, ids.seq, &wire);
        if let Err(e) = self.socket.send_to(&packet, peer).await {
            warn!("ping reply to {} failed: {}", peer, e);
        }
    }

    /// Route a data payload into its session, establishing it first if this
    /// is the tunnel's first packet.
    async fn relay_data(&mut self, msg: TunnelMessage, peer: Ipv4Addr, ids: EchoIds) {
        if !self.sessions.contains_key(&msg.tunnel_id) {
            match self.open_session(&msg, peer, ids).await {
                Ok(session) => {
                    info!(
                        "new {} session {} -> {}",
                        if msg.is_stream() { "stream" } else { "datagram" },
                        msg.tunnel_id,
                        msg.target
                    );
                    self.sessions.insert(msg.tunnel_id.clone(), session);
                }
                Err(e) => {
                    error!("connecting to {} failed: {}", msg.target, e);
                    return;
                }
            }
        }

        let Some(session) = self.sessions.get_mut(&msg.tunnel_id) else {
            return;
        };
        session.touch(ids);

        match session.route() {
            SessionRoute::Stream(queue) => match Frame::decode(&msg.payload) {
                Ok(frame) => queue.push(frame),
                Err(e) => warn!("dropping malformed frame from {}: {}", peer, e),
            },
            SessionRoute::Datagram(tx) => {
                // A full channel drops the datagram, matching UDP semantics;
                // a closed one means the relay task already ended.
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(msg.payload) {
                    session.close();
                }
            }
        }
    }

    /// Dial the upstream target and spawn the session's relay task.
    async fn open_session(
        &self,
        msg: &TunnelMessage,
        peer: Ipv4Addr,
        ids: EchoIds,
    ) -> io::Result<ServerSession> {
        let echo = Arc::new(Mutex::new(ids));
        let closed = Arc::new(AtomicBool::new(false));
        let reply = ReplyContext {
            socket: self.socket.clone(),
            peer,
            key: self.config.key,
            tunnel_id: msg.tunnel_id.clone(),
            echo_type: msg.reply_type,
            echo: echo.clone(),
            stats: self.stats.clone(),
        };

        let route = if let Some(params) = msg.stream {
            let upstream = TcpStream::connect(&msg.target).await?;
            let fm = FrameManager::new(
                params.buffer_size as usize,
                params.window_size as usize,
                Duration::from_millis(u64::from(params.resend_timeout_ms)),
            );
            let queue = fm.ingest_queue();
            tokio::spawn(run_stream_relay(fm, upstream, reply, closed.clone()));
            SessionRoute::Stream(queue)
        } else {
            let upstream = UdpSocket::bind("0.0.0.0:0").await?;
            upstream.connect(&msg.target).await?;
            let (tx, rx) = mpsc::channel(1024);
            tokio::spawn(run_datagram_relay(upstream, rx, reply, closed.clone()));
            SessionRoute::Datagram(tx)
        };

        Ok(ServerSession::new(
            msg.tunnel_id.clone(),
            peer,
            msg.target.clone(),
            msg.reply_type,
            route,
            echo,
            closed,
        ))
    }
}

/// Receive echoes, decode their tunnel messages, and hand them to the
/// server loop. Non-tunnel ICMP traffic on the raw socket is ignored.
async fn recv_echoes(socket: Arc<IcmpSocket>, tx: mpsc::Sender<Arrival>) {
    let mut buf = vec![0u8; ICMP_RECV_BUFFER_SIZE];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("icmp receive failed: {}", e);
                break;
            }
        };
        let IpAddr::V4(peer) = addr else { continue };
        let Some(echo) = parse_echo(&buf[..len]) else {
            continue;
        };
        // The raw socket also sees our own replies.
        if echo.echo_type != ECHO_REQUEST {
            continue;
        }
        let Ok(msg) = TunnelMessage::decode(&echo.payload) else {
            // Ordinary pings from unrelated tools.
            continue;
        };

        let arrival = Arrival {
            msg,
            peer,
            ids: EchoIds {
                ident: echo.ident,
                seq: echo.seq,
            },
        };
        if tx.send(arrival).await.is_err() {
            break;
        }
    }
}

/// Bridge one tunneled TCP stream: upstream bytes into the multiplexer,
/// due frames out as echo replies, reassembled bytes back upstream.
async fn run_stream_relay(
    mut fm: FrameManager,
    mut upstream: TcpStream,
    reply: ReplyContext,
    closed: Arc<AtomicBool>,
) {
    let mut read_buf = vec![0u8; UPSTREAM_READ_CHUNK];
    let mut tick = time::interval(Duration::from_millis(10));

    'relay: loop {
        tokio::select! {
            _ = tick.tick() => {}
            read = upstream.read(&mut read_buf), if fm.send_free() >= read_buf.len() => match read {
                Ok(0) => {
                    debug!("upstream closed for {}", reply.tunnel_id);
                    break 'relay;
                }
                Ok(n) => {
                    fm.write_send(&read_buf[..n])
                        .expect("the read was gated on send_free");
                }
                Err(e) => {
                    error!("upstream read failed for {}: {}", reply.tunnel_id, e);
                    break 'relay;
                }
            },
        }

        fm.update();
        for frame in fm.drain_outgoing() {
            match frame.encode() {
                Ok(wire) => reply.send_data(wire).await,
                Err(e) => error!("frame encode failed for {}: {}", reply.tunnel_id, e),
            }
        }

        while fm.recv_len() > 0 {
            let take = fm.recv_len().min(read_buf.len());
            let mut chunk = vec![0u8; take];
            fm.read_recv(&mut chunk).expect("recv_len was just checked");
            if let Err(e) = upstream.write_all(&chunk).await {
                error!("upstream write failed for {}: {}", reply.tunnel_id, e);
                break 'relay;
            }
        }
    }

    closed.store(true, Ordering::Release);
}

/// Bridge one datagram session: client payloads to the UDP upstream,
/// upstream datagrams back as echo replies.
async fn run_datagram_relay(
    upstream: UdpSocket,
    mut payloads: mpsc::Receiver<Vec<u8>>,
    reply: ReplyContext,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; ICMP_RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            outbound = payloads.recv() => match outbound {
                Some(datagram) => {
                    if let Err(e) = upstream.send(&datagram).await {
                        error!("upstream send failed for {}: {}", reply.tunnel_id, e);
                        break;
                    }
                }
                // The sweeper dropped the session.
                None => break,
            },
            inbound = upstream.recv(&mut buf) => match inbound {
                Ok(n) => reply.send_data(buf[..n].to_vec()).await,
                Err(e) => {
                    error!("upstream recv failed for {}: {}", reply.tunnel_id, e);
                    break;
                }
            },
        }
    }

    closed.store(true, Ordering::Release);
}

/// Drop sessions whose relay ended and idle datagram sessions.
///
/// Stream sessions have no idle timeout: their lifetime is their upstream
/// connection's.
fn sweep_sessions(sessions: &mut HashMap<String, ServerSession>, timeout: Duration) {
    sessions.retain(|id, session| {
        if session.is_closed() {
            info!("session {} ended ({})", id, session.target());
            return false;
        }
        if matches!(session.route(), SessionRoute::Datagram(_)) && session.idle_time() > timeout {
            info!("closing idle session {} ({})", id, session.target());
            session.close();
            return false;
        }
        true
    });
}

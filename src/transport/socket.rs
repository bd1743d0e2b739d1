//! Async raw ICMP socket.
//!
//! Wraps a `SOCK_RAW`/`IPPROTO_ICMP` file descriptor in tokio's nonblocking
//! UDP machinery so the server loop can await echo datagrams like any other
//! socket. Opening it requires CAP_NET_RAW (or root); the constructor
//! surfaces the kernel's refusal as a plain `io::Error`.
//!
//! Received datagrams include the IPv4 header; callers hand them to
//! [`parse_echo`](super::icmp::parse_echo), which strips it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

/// Async ICMP socket speaking raw echo datagrams.
#[derive(Debug)]
pub struct IcmpSocket {
    socket: UdpSocket,
}

impl IcmpSocket {
    /// Open a raw ICMP socket on the host.
    pub fn new() -> io::Result<Self> {
        Self::from_socket(raw_icmp_socket()?)
    }

    /// Wrap an already-opened datagram socket.
    ///
    /// Lets a privileged launcher open the raw socket before dropping
    /// capabilities and hand it over here; `new` is the common path.
    pub fn from_socket(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
        })
    }

    /// Send a fully built ICMP packet to `peer`.
    pub async fn send_to(&self, packet: &[u8], peer: Ipv4Addr) -> io::Result<usize> {
        self.socket
            .send_to(packet, SocketAddr::new(IpAddr::V4(peer), 0))
            .await
    }

    /// Receive one datagram, returning its length and the sender address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        Ok((len, addr.ip()))
    }
}

#[cfg(unix)]
fn raw_icmp_socket() -> io::Result<std::net::UdpSocket> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: a freshly created raw fd is exclusively owned by the returned
    // UdpSocket, which closes it on drop.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { std::net::UdpSocket::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn raw_icmp_socket() -> io::Result<std::net::UdpSocket> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "raw ICMP sockets are only supported on unix targets",
    ))
}

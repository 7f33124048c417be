//! GRE bearer: GRE-over-raw-IPv4 (protocol 47), matching `GreSocket`.
//!
//! There is no portable async primitive for raw sockets in `tokio`, so this
//! wraps a non-blocking `socket2::Socket` in `tokio::io::unix::AsyncFd`,
//! the same integration pattern `socket-factory` uses for its UDP/TCP
//! sockets (non-blocking `socket2::Socket` handed to a `tokio` wrapper),
//! just one layer lower since `tokio::net` has no raw-socket type.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use ip_packet::{gre_ip_protocol, parse_gre_datagram, GreError};

#[derive(Debug, thiserror::Error)]
pub enum GreBearerError {
    #[error("failed to create raw GRE socket: {0}")]
    Create(#[source] io::Error),
    #[error("failed to bind GRE socket to {0}: {1}")]
    Bind(Ipv4Addr, #[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A bound raw socket used to send/receive GRE-encapsulated IPv4 datagrams.
pub struct GreBearer {
    fd: AsyncFd<Socket>,
    local_addr: Ipv4Addr,
}

/// Maximum datagram size we're willing to read off the raw socket.
const MAX_DATAGRAM: usize = 65536;

impl GreBearer {
    pub fn bind(local_addr: Ipv4Addr) -> Result<Self, GreBearerError> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(gre_ip_protocol() as i32)),
        )
        .map_err(GreBearerError::Create)?;

        socket.set_reuse_address(true).map_err(GreBearerError::Create)?;
        socket.set_nonblocking(true).map_err(GreBearerError::Create)?;

        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(local_addr, 0)));
        socket
            .bind(&addr)
            .map_err(|e| GreBearerError::Bind(local_addr, e))?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    /// Sends `gre_header ++ payload` to `remote`. The GRE header is built by
    /// the caller via [`ip_packet::gre_header`] and prepended to `payload`
    /// before calling this (matching the xmit task's single contiguous
    /// `sendto` in the original).
    pub async fn send_to(&self, datagram: &[u8], remote: Ipv4Addr) -> io::Result<usize> {
        let dest = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(remote, 0)));

        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|inner| inner.get_ref().send_to(datagram, &dest)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Receives one raw IP datagram, validates it as GRE-over-IPv4, and
    /// returns the remote IPv4 source address plus the decapsulated
    /// payload. Invalid GRE framing (bad IHL, non-zero flags, wrong
    /// protocol type) is surfaced as an error so the receive loop can drop
    /// it without altering dedup state (spec invariant: GRE header
    /// tolerance).
    pub async fn recv(&self) -> Result<(Ipv4Addr, Vec<u8>), GreRecvError> {
        let mut buf = [0u8; MAX_DATAGRAM];

        let n = loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };

        let datagram = parse_gre_datagram(&buf[..n])?;
        let source = datagram.outer_header.source;
        let payload = datagram.payload.to_vec();

        Ok((source, payload))
    }

    /// Waits up to `timeout` for a readable event without consuming it —
    /// used by the receive task to implement the 5s poll-and-check-shutdown
    /// loop (spec §4.6) without blocking forever on `recv`.
    pub async fn poll_readable(&self, timeout: Duration) -> PollOutcome {
        match tokio::time::timeout(timeout, self.fd.readable()).await {
            Ok(Ok(guard)) => {
                guard.clone().retain_ready();
                PollOutcome::Ready
            }
            Ok(Err(_)) => PollOutcome::Error,
            Err(_elapsed) => PollOutcome::TimedOut,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GreRecvError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid GRE framing: {0}")]
    Framing(#[from] GreError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    TimedOut,
    Error,
}

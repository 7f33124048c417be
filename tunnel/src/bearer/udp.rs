//! UDP bearer: plain datagrams, trailer-based dedup handled by the manager.
//!
//! Grounded on the same `socket2` non-blocking bind pattern as the GRE
//! bearer, but UDP gets a first-class `tokio::net::UdpSocket` conversion
//! instead of `AsyncFd`, the same as `socket_factory::udp`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::UdpSocket as TokioUdpSocket;

#[derive(Debug, thiserror::Error)]
pub enum UdpBearerError {
    #[error("failed to create UDP socket: {0}")]
    Create(#[source] io::Error),
    #[error("failed to bind UDP socket to {0}:{1}: {2}")]
    Bind(Ipv4Addr, u16, #[source] io::Error),
}

const MAX_DATAGRAM: usize = 65536;

/// Max payload length, keeping the 8-byte pktid trailer under a full
/// datagram.
pub struct UdpBearer {
    socket: TokioUdpSocket,
    local_addr: Ipv4Addr,
    local_port: u16,
}

impl UdpBearer {
    pub fn bind(local_addr: Ipv4Addr, local_port: u16) -> Result<Self, UdpBearerError> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(local_addr, local_port)));
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(UdpBearerError::Create)?;

        socket.set_nonblocking(true).map_err(UdpBearerError::Create)?;
        socket
            .bind(&addr)
            .map_err(|e| UdpBearerError::Bind(local_addr, local_port, e))?;

        let std_socket = std::net::UdpSocket::from(socket);
        let socket = TokioUdpSocket::from_std(std_socket).map_err(UdpBearerError::Create)?;

        Ok(Self {
            socket,
            local_addr,
            local_port,
        })
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Sends `datagram` (payload + 8-byte pktid trailer, already assembled
    /// by the caller) verbatim to `remote`.
    pub async fn send_to(
        &self,
        datagram: &[u8],
        remote: Ipv4Addr,
        remote_port: u16,
    ) -> io::Result<usize> {
        self.socket
            .send_to(datagram, SocketAddrV4::new(remote, remote_port))
            .await
    }

    /// Receives one datagram and returns its source address plus raw bytes
    /// (pktid trailer still attached; the manager strips and checks it).
    pub async fn recv(&self) -> io::Result<(Ipv4Addr, u16, Vec<u8>)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = self.socket.recv_from(&mut buf).await?;

        let ip = match from.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "received from an IPv6 peer on an IPv4 bearer",
                ))
            }
        };

        Ok((ip, from.port(), buf[..n].to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_datagram_over_loopback() {
        let a = UdpBearer::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        let b = UdpBearer::bind(Ipv4Addr::LOCALHOST, 0).unwrap();

        a.send_to(b"hello-trailer!!", Ipv4Addr::LOCALHOST, b.local_port())
            .await
            .unwrap();

        let (from_addr, _from_port, received) = b.recv().await.unwrap();
        assert_eq!(from_addr, Ipv4Addr::LOCALHOST);
        assert_eq!(received, b"hello-trailer!!");
    }
}

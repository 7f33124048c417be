//! Framed TCP bearer, mirroring `TcpConnectionMgr`: a connection-manager
//! task that connects (client) or accepts (server), spawns a dedicated
//! receiver task per connection, and drains a bounded outgoing queue with a
//! single-slot retry buffer across reconnects.
//!
//! Wire format: 4-byte big-endian length prefix, followed by `len + 8`
//! bytes of payload (the last 8 being the pktid trailer the manager already
//! appended). `0 < len < 131072`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use crate::bearer::Role;
use crate::queue::{BoundedQueue, Timeout};

const OUTGOING_QUEUE_LEN: usize = 10_000;
const INBOUND_QUEUE_LEN: usize = 10_000;
const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(800);
const MAX_FRAME_LEN: u32 = 128 * 1024;

/// A running framed-TCP bearer: owns the outgoing/inbound queues and the
/// background connection-manager task. Dropping this does not join the
/// task; call [`TcpBearer::shutdown`] first if a clean stop matters.
pub struct TcpBearer {
    outgoing: Arc<BoundedQueue<Vec<u8>>>,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
    manager: JoinHandle<()>,
}

impl TcpBearer {
    /// Spawns the connection-manager task for a server bearer (accepts
    /// inbound connections on `local_addr:local_port`).
    pub fn spawn_server(local_addr: Ipv4Addr, local_port: u16) -> Self {
        Self::spawn(Endpoint {
            role: Role::Server,
            local_addr,
            local_port,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        })
    }

    /// Spawns the connection-manager task for a client bearer (dials
    /// `remote_addr:remote_port` from `local_addr:local_port`).
    pub fn spawn_client(
        local_addr: Ipv4Addr,
        local_port: u16,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> Self {
        Self::spawn(Endpoint {
            role: Role::Client,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
        })
    }

    fn spawn(endpoint: Endpoint) -> Self {
        let outgoing = Arc::new(BoundedQueue::new(OUTGOING_QUEUE_LEN));
        let inbound = Arc::new(BoundedQueue::new(INBOUND_QUEUE_LEN));
        let shutdown = Arc::new(AtomicBool::new(false));

        let manager = tokio::spawn(run_connection_manager(
            endpoint,
            outgoing.clone(),
            inbound.clone(),
            shutdown.clone(),
        ));

        Self {
            outgoing,
            inbound,
            shutdown,
            manager,
        }
    }

    /// Enqueues `payload` (already including its trailing pktid) for
    /// transmission. Returns `false` if the outgoing queue is full — the
    /// caller drops the packet and continues (spec: TCP fan-out never
    /// blocks the transmit path).
    pub async fn send(&self, payload: Vec<u8>) -> bool {
        self.outgoing.push(payload).await.is_ok()
    }

    /// Pops one received message (trailer still attached), waiting up to
    /// `timeout`.
    pub async fn recv(&self, timeout: Timeout) -> Option<Vec<u8>> {
        let shutdown = self.shutdown.clone();
        self.inbound
            .pop(timeout, move || shutdown.load(Ordering::SeqCst))
            .await
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        let _ = self.manager.await;
    }
}

struct Endpoint {
    role: Role,
    local_addr: Ipv4Addr,
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
}

async fn run_connection_manager(
    endpoint: Endpoint,
    outgoing: Arc<BoundedQueue<Vec<u8>>>,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
) {
    let listener = if endpoint.role == Role::Server {
        match TcpListener::bind((endpoint.local_addr, endpoint.local_port)).await {
            Ok(l) => Some(l),
            Err(err) => {
                tracing::error!(%err, "failed to bind TCP bearer listener");
                return;
            }
        }
    } else {
        None
    };

    // Single-slot retry buffer: a message that failed to send during the
    // previous connection is retried first on the next one, same as the
    // original's front-of-list retry buffer.
    let mut retry: Option<Vec<u8>> = None;

    while !shutdown.load(Ordering::SeqCst) {
        let stream = match connect_or_accept(&endpoint, listener.as_ref(), &shutdown).await {
            Some(stream) => stream,
            None => return, // shutting down
        };

        tracing::warn!(role = ?endpoint.role, "TCP bearer connected");

        let (read_half, mut write_half) = stream.into_split();
        let recv_inbound = inbound.clone();
        let recv_shutdown = shutdown.clone();
        let receiver = tokio::spawn(run_receiver(read_half, recv_inbound, recv_shutdown));

        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let buf = if let Some(buf) = retry.take() {
                buf
            } else {
                let shutdown = shutdown.clone();
                match outgoing
                    .pop(Timeout::After(RECV_TIMEOUT), move || {
                        shutdown.load(Ordering::SeqCst)
                    })
                    .await
                {
                    Some(buf) => buf,
                    None => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        continue;
                    }
                }
            };

            if let Err(err) = send_framed(&mut write_half, &buf).await {
                tracing::error!(%err, "TCP bearer send failed, reconnecting");
                retry = Some(buf);
                break;
            }
        }

        receiver.abort();
        let _ = receiver.await;
    }
}

async fn connect_or_accept(
    endpoint: &Endpoint,
    listener: Option<&TcpListener>,
    shutdown: &AtomicBool,
) -> Option<TcpStream> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return None;
        }

        let attempt = match (endpoint.role, listener) {
            (Role::Server, Some(listener)) => listener.accept().await.map(|(s, _)| s),
            (Role::Client, _) => connect_from(endpoint).await,
            (Role::Server, None) => unreachable!("server role always has a listener"),
        };

        match attempt {
            Ok(stream) => return Some(stream),
            Err(err) => {
                tracing::error!(%err, role = ?endpoint.role, "TCP bearer connect/accept failed, retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Binds to `endpoint.local_addr`/`local_port` before connecting, matching
/// `gre.rs`/`udp.rs`'s bind-before-use and the client role's "bind then
/// connect" contract.
async fn connect_from(endpoint: &Endpoint) -> std::io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(std::net::SocketAddr::from((endpoint.local_addr, endpoint.local_port)))?;
    socket
        .connect(std::net::SocketAddr::from((
            endpoint.remote_addr,
            endpoint.remote_port,
        )))
        .await
}

async fn send_framed(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    payload: &[u8],
) -> std::io::Result<()> {
    // `payload` already carries the 8-byte pktid trailer `manager.rs`
    // appends; the length prefix covers only the IP payload, matching what
    // `run_receiver` expects on the other end.
    let len = (payload.len() - 8) as u32;
    write_half.write_all(&len.to_be_bytes()).await?;
    write_half.write_all(payload).await?;
    write_half.flush().await
}

async fn run_receiver(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    inbound: Arc<BoundedQueue<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let mut len_buf = [0u8; 4];
        let read = tokio::time::timeout(RECV_TIMEOUT, read_half.read_exact(&mut len_buf)).await;

        let len = match read {
            Ok(Ok(_)) => u32::from_be_bytes(len_buf),
            Ok(Err(_)) => return, // connection closed or errored
            Err(_elapsed) => continue,
        };

        if len == 0 || len >= MAX_FRAME_LEN {
            tracing::error!(len, "TCP bearer received an out-of-range frame length");
            return;
        }

        let mut body = vec![0u8; len as usize + 8];
        match tokio::time::timeout(RECV_TIMEOUT, read_half.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return, // connection closed or errored
            Err(_elapsed) => {
                tracing::error!("TCP bearer timed out reading frame body");
                return;
            }
        }

        let _ = inbound.push(body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_and_server_exchange_a_framed_message() {
        let port = 28901;
        let server = TcpBearer::spawn_server(Ipv4Addr::LOCALHOST, port);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = TcpBearer::spawn_client(Ipv4Addr::LOCALHOST, 0, Ipv4Addr::LOCALHOST, port);

        let mut payload = b"payload!".to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(client.send(payload.clone()).await);

        let received = tokio::time::timeout(Duration::from_secs(2), server.recv(Timeout::Forever))
            .await
            .expect("server should receive the message")
            .expect("queue should yield the payload");

        assert_eq!(received, payload);

        client.shutdown();
        server.shutdown();
    }
}

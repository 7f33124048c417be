//! Virtual interface manager, mirroring `VirtualIfMgr`.
//!
//! `get_packet` only ever reads from the first-registered device, the same
//! limitation `VirtualIfMgr::getPacket` has (it always dereferences
//! `_devs.begin()`): with more than one TUN device registered, only the
//! first one is ever drained. This is preserved rather than fixed into a
//! round-robin — see `DESIGN.md` for the Open Question decision.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Matches `VirtualIfMgr::MAX_PKT_SIZE`.
pub const MAX_PKT_SIZE: usize = 64 * 1024;

/// A TUN/TAP-like device: read one packet, write one packet, report a name.
#[async_trait]
pub trait TunDevice: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_packet(&self, data: &[u8]) -> io::Result<usize>;
    fn name(&self) -> &str;
}

struct Registered {
    name: String,
    dev: Arc<dyn TunDevice>,
}

#[derive(Default)]
pub struct VirtualIfMgr {
    /// Registration order, not lookup order: `get_packet` always reads
    /// `devs[0]`, same as the original reading `_devs.begin()`.
    devs: Mutex<Vec<Registered>>,
    by_name: Mutex<HashMap<String, usize>>,
}

impl VirtualIfMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: registering an already-known name is a no-op success.
    pub async fn add_if(&self, name: &str, dev: Arc<dyn TunDevice>) {
        let mut by_name = self.by_name.lock().await;
        if by_name.contains_key(name) {
            return;
        }

        let mut devs = self.devs.lock().await;
        by_name.insert(name.to_string(), devs.len());
        devs.push(Registered {
            name: name.to_string(),
            dev,
        });
    }

    /// Writes `data` to the named device, truncating to [`MAX_PKT_SIZE`].
    pub async fn announce_packet(&self, name: &str, data: &[u8]) -> io::Result<usize> {
        let by_name = self.by_name.lock().await;
        let idx = *by_name
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such virtual interface"))?;

        let devs = self.devs.lock().await;
        let dev = &devs[idx].dev;
        let truncated = &data[..data.len().min(MAX_PKT_SIZE)];
        dev.write_packet(truncated).await
    }

    /// Reads one packet from the first registered device, returning the
    /// bytes read and that device's name.
    pub async fn get_packet(&self, buf: &mut [u8]) -> io::Result<(usize, String)> {
        let devs = self.devs.lock().await;
        let first = devs
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no virtual interfaces registered"))?;

        let n = first.dev.read_packet(buf).await?;
        Ok((n, first.name.clone()))
    }
}

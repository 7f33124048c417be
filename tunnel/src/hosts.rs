//! Hosts-file writer, mirroring `SipServerTask::updateDns`: prelude lines
//! from config plus an allocator snapshot, written to a configured path and
//! optionally followed by a `dnsmasq` reload.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::alloc::{AllocError, Clock, LogicalAddressAllocator};

#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("no hosts file configured")]
    NotConfigured,
    #[error("failed writing hosts file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Writes `prelude` (static lines from the `[dns]` config section, one per
/// non-`hosts` key) followed by the allocator's current name/IP bindings to
/// `path`.
pub async fn write_hosts_file<C: Clock>(
    path: &Path,
    prelude: &str,
    allocator: &LogicalAddressAllocator<C>,
) -> Result<(), HostsError> {
    let mut contents = String::new();
    contents.push_str(prelude);
    contents.push('\n');
    contents.push_str(&allocator.get_hosts()?);

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| HostsError::Io(path.to_path_buf(), e))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| HostsError::Io(path.to_path_buf(), e))?;
    file.flush()
        .await
        .map_err(|e| HostsError::Io(path.to_path_buf(), e))?;

    Ok(())
}

//! Route programming, mirroring `RouteMgr`: shelling out to `ip route`.
//!
//! Kept behind a trait so the SIP registration handler can be tested
//! without touching the host's routing table.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("failed to spawn route command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("route command exited with non-zero status: {0}")]
    NonZeroExit(std::process::ExitStatus),
}

#[async_trait]
pub trait RouteProgrammer: Send + Sync {
    async fn add_via_device(&self, ip: Ipv4Addr, dev: &str, mask: &str) -> Result<(), RouteError>;
    async fn add_via_gateway(
        &self,
        ip: Ipv4Addr,
        via: Ipv4Addr,
        mask: &str,
    ) -> Result<(), RouteError>;
    async fn del(&self, ip: Ipv4Addr, mask: &str) -> Result<(), RouteError>;
}

/// Default mask used when a caller doesn't supply one, matching `RouteMgr`'s
/// `"/32"` default argument.
pub const DEFAULT_MASK: &str = "/32";

/// Programs routes by shelling out to the system `ip` binary, deleting any
/// existing route for the target first (the original always does `del`
/// before `add`, ignoring whether one existed).
pub struct ShellRouteProgrammer;

#[async_trait]
impl RouteProgrammer for ShellRouteProgrammer {
    async fn add_via_device(&self, ip: Ipv4Addr, dev: &str, mask: &str) -> Result<(), RouteError> {
        let _ = self.del(ip, mask).await;
        run(&format!("ip route add {ip}{mask} dev {dev}")).await
    }

    async fn add_via_gateway(
        &self,
        ip: Ipv4Addr,
        via: Ipv4Addr,
        mask: &str,
    ) -> Result<(), RouteError> {
        let _ = self.del(ip, mask).await;
        run(&format!("ip route add {ip}{mask} via {via}")).await
    }

    async fn del(&self, ip: Ipv4Addr, mask: &str) -> Result<(), RouteError> {
        run(&format!("ip route del {ip}{mask}")).await
    }
}

async fn run(cmd: &str) -> Result<(), RouteError> {
    tracing::debug!(%cmd, "RouteMgr");

    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .status()
        .await
        .map_err(RouteError::Spawn)?;

    if !status.success() {
        return Err(RouteError::NonZeroExit(status));
    }

    Ok(())
}

/// Test double that records calls instead of touching the host.
#[derive(Default)]
pub struct NullRouteProgrammer {
    pub calls: tokio::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl RouteProgrammer for NullRouteProgrammer {
    async fn add_via_device(&self, ip: Ipv4Addr, dev: &str, mask: &str) -> Result<(), RouteError> {
        self.calls
            .lock()
            .await
            .push(format!("add {ip}{mask} dev {dev}"));
        Ok(())
    }

    async fn add_via_gateway(
        &self,
        ip: Ipv4Addr,
        via: Ipv4Addr,
        mask: &str,
    ) -> Result<(), RouteError> {
        self.calls
            .lock()
            .await
            .push(format!("add {ip}{mask} via {via}"));
        Ok(())
    }

    async fn del(&self, ip: Ipv4Addr, mask: &str) -> Result<(), RouteError> {
        self.calls.lock().await.push(format!("del {ip}{mask}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_programmer_records_calls_without_side_effects() {
        let rp = NullRouteProgrammer::default();
        rp.add_via_device("10.0.0.5".parse().unwrap(), "tun0", DEFAULT_MASK)
            .await
            .unwrap();

        assert_eq!(
            rp.calls.lock().await.as_slice(),
            &["add 10.0.0.5/32 dev tun0".to_string()]
        );
    }
}

//! Turns a parsed [`Config`] into the bearer descriptors the manager needs,
//! per the `[tunnels]`/`[<tunnel-name>]`/`[<bearer-name>]` section grammar.

use std::net::Ipv4Addr;
use std::time::Duration;

use tunnel::bearer::{Protocol, DEFAULT_PORT};
use tunnel::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("[tunnels] list is missing or empty")]
    NoTunnels,
    #[error("tunnel {0:?}: missing `bearers` key")]
    MissingBearers(String),
    #[error("bearer {0:?}: missing `local_address`")]
    MissingLocalAddress(String),
    #[error("bearer {0:?}: missing `remote_address`")]
    MissingRemoteAddress(String),
    #[error("bearer {0:?}: missing `type`")]
    MissingType(String),
    #[error("bearer {0:?}: unrecognised bearer type {1:?}")]
    UnknownType(String, String),
    #[error("bearer {0:?}: invalid address {1:?}: {2}")]
    BadAddress(String, String, std::net::AddrParseError),
    #[error("bearer {0:?}: invalid port {1:?}")]
    BadPort(String, String),
}

#[derive(Debug, Clone)]
pub struct BearerConfig {
    pub ifname: String,
    pub bearer_name: String,
    pub protocol: Protocol,
    pub local_address: Ipv4Addr,
    pub remote_address: Ipv4Addr,
    pub port: u16,
}

/// Reads every tunnel named in `[tunnels] list` and every bearer named in
/// each tunnel's `bearers` key, falling back to the tunnel's own
/// `type`/`local_address`/`remote_address`/`port` when a bearer section
/// doesn't override them.
pub fn build_bearers(cfg: &Config, cli_port: Option<u16>) -> Result<Vec<BearerConfig>, WireError> {
    let list = cfg.get("tunnels", "list").ok_or(WireError::NoTunnels)?;
    let tunnel_names: Vec<&str> = list.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();

    if tunnel_names.is_empty() {
        return Err(WireError::NoTunnels);
    }

    let mut out = Vec::new();

    for ifname in tunnel_names {
        let bearers = cfg
            .get(ifname, "bearers")
            .ok_or_else(|| WireError::MissingBearers(ifname.to_string()))?;

        let tunnel_type = cfg.get(ifname, "type");
        let tunnel_local = cfg.get(ifname, "local_address");
        let tunnel_remote = cfg.get(ifname, "remote_address");
        let tunnel_port = cfg.get(ifname, "port");

        for bearer_name in bearers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = cfg
                .get(bearer_name, "type")
                .or(tunnel_type)
                .ok_or_else(|| WireError::MissingType(bearer_name.to_string()))?;

            let protocol = match kind {
                "gre" => Protocol::Gre,
                "udp" => Protocol::Udp,
                "tcp" => Protocol::Tcp,
                other => {
                    return Err(WireError::UnknownType(
                        bearer_name.to_string(),
                        other.to_string(),
                    ))
                }
            };

            let local_raw = cfg
                .get(bearer_name, "local_address")
                .or(tunnel_local)
                .ok_or_else(|| WireError::MissingLocalAddress(bearer_name.to_string()))?;
            let remote_raw = cfg
                .get(bearer_name, "remote_address")
                .or(tunnel_remote)
                .ok_or_else(|| WireError::MissingRemoteAddress(bearer_name.to_string()))?;

            let local_address: Ipv4Addr = local_raw
                .parse()
                .map_err(|e| WireError::BadAddress(bearer_name.to_string(), local_raw.to_string(), e))?;
            let remote_address: Ipv4Addr = remote_raw
                .parse()
                .map_err(|e| WireError::BadAddress(bearer_name.to_string(), remote_raw.to_string(), e))?;

            let port = match cfg.get(bearer_name, "port").or(tunnel_port) {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| WireError::BadPort(bearer_name.to_string(), raw.to_string()))?,
                None => cli_port.unwrap_or(DEFAULT_PORT),
            };

            out.push(BearerConfig {
                ifname: ifname.to_string(),
                bearer_name: bearer_name.to_string(),
                protocol,
                local_address,
                remote_address,
                port,
            });
        }
    }

    Ok(out)
}

/// `[logical_address_range] first_ip`, `last_ip`, optional `ttl` (seconds).
pub struct AddressRangeConfig {
    pub first_ip: Ipv4Addr,
    pub last_ip: Ipv4Addr,
    pub ttl: Option<Duration>,
}

pub fn read_address_range(cfg: &Config) -> Option<AddressRangeConfig> {
    let first_ip = cfg.get("logical_address_range", "first_ip")?.parse().ok()?;
    let last_ip = cfg.get("logical_address_range", "last_ip")?.parse().ok()?;
    let ttl = cfg
        .get("logical_address_range", "ttl")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    Some(AddressRangeConfig {
        first_ip,
        last_ip,
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_bearer_per_tunnel_with_inherited_defaults() {
        let cfg = tunnel::config::parse(
            "[tunnels]\nlist = \"t0\"\n\
             [t0]\nbearers = \"b0\"\ntype = \"udp\"\nlocal_address = \"10.0.0.1\"\nremote_address = \"10.0.0.2\"\n\
             [b0]\n",
        )
        .unwrap();

        let bearers = build_bearers(&cfg, None).unwrap();
        assert_eq!(bearers.len(), 1);
        assert_eq!(bearers[0].ifname, "t0");
        assert_eq!(bearers[0].protocol, Protocol::Udp);
        assert_eq!(bearers[0].port, DEFAULT_PORT);
    }

    #[test]
    fn bearer_section_overrides_tunnel_defaults() {
        let cfg = tunnel::config::parse(
            "[tunnels]\nlist = \"t0\"\n\
             [t0]\nbearers = \"b0\"\ntype = \"gre\"\nlocal_address = \"10.0.0.1\"\nremote_address = \"10.0.0.2\"\n\
             [b0]\ntype = \"tcp\"\nport = 5000\n",
        )
        .unwrap();

        let bearers = build_bearers(&cfg, None).unwrap();
        assert_eq!(bearers[0].protocol, Protocol::Tcp);
        assert_eq!(bearers[0].port, 5000);
    }

    #[test]
    fn missing_tunnels_list_is_an_error() {
        let cfg = tunnel::config::parse("[other]\nkey = \"value\"\n").unwrap();
        assert!(matches!(build_bearers(&cfg, None), Err(WireError::NoTunnels)));
    }
}

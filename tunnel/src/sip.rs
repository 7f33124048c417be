//! Minimal REGISTER handling, grounded on `SipServerTask::processRequest`'s
//! `register` branch.
//!
//! This does not parse or format SIP messages, nor run a listener — those
//! are out of scope. It only implements the allocate-ip-then-program-route
//! decision a REGISTER request drives, so the control-channel interface can
//! be wired up later without redoing this logic.

use std::net::Ipv4Addr;

use crate::alloc::{AllocError, Clock, LogicalAddressAllocator};
use crate::route::{RouteError, RouteProgrammer, DEFAULT_MASK};

/// The fields `processRequest` extracts out of a REGISTER request before
/// deciding how to route it.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub contact: String,
    pub from: String,
    pub tunnel_id: Option<String>,
    /// `true` when the registrant is a server agent (registering over a
    /// local interface); `false` for a user-agent registering over a
    /// tunnel.
    pub is_server_agent: bool,
    /// Peer address the TCP/SIP connection itself arrived from, used as the
    /// route gateway for server-agent registrations.
    pub peer_addr: Ipv4Addr,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Ok(Ipv4Addr),
    BadRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Handles one REGISTER: allocates (or resolves the sticky) IP for the
/// registering name, then programs a route to it — via the named tunnel
/// interface for a user-agent, or via the peer's address for a server
/// agent. A missing tunnel id is a 400 (matches the original returning
/// `SipResponse(message, 400)` when `tunnelId` is empty).
pub async fn handle_register<C: Clock>(
    req: &RegisterRequest,
    allocator: &LogicalAddressAllocator<C>,
    routes: &dyn RouteProgrammer,
) -> Result<RegisterOutcome, RegisterError> {
    let registering_name = if req.contact.is_empty() {
        &req.from
    } else {
        &req.contact
    };

    if registering_name.is_empty() {
        return Ok(RegisterOutcome::BadRequest);
    }

    let ip = allocator.generate_ip(&req.contact)?;

    if !req.is_server_agent {
        let Some(tunnel_id) = req.tunnel_id.as_deref() else {
            return Ok(RegisterOutcome::BadRequest);
        };

        routes.add_via_device(ip, tunnel_id, DEFAULT_MASK).await?;
        return Ok(RegisterOutcome::Ok(ip));
    }

    if req.tunnel_id.is_none() {
        return Ok(RegisterOutcome::BadRequest);
    }

    routes
        .add_via_gateway(ip, req.peer_addr, DEFAULT_MASK)
        .await?;

    Ok(RegisterOutcome::Ok(ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemClock;
    use crate::route::NullRouteProgrammer;
    use std::time::Duration;

    fn allocator() -> LogicalAddressAllocator<SystemClock> {
        let a = LogicalAddressAllocator::new(SystemClock);
        a.configure(
            "10.1.0.1".parse().unwrap(),
            "10.1.0.254".parse().unwrap(),
            Some(Duration::from_secs(3600)),
        )
        .unwrap();
        a
    }

    #[tokio::test]
    async fn user_agent_register_routes_via_tunnel_interface() {
        let alloc = allocator();
        let routes = NullRouteProgrammer::default();

        let req = RegisterRequest {
            contact: "alice".to_string(),
            from: "alice".to_string(),
            tunnel_id: Some("tun0".to_string()),
            is_server_agent: false,
            peer_addr: "10.0.0.9".parse().unwrap(),
        };

        let outcome = handle_register(&req, &alloc, &routes).await.unwrap();
        let RegisterOutcome::Ok(ip) = outcome else {
            panic!("expected Ok outcome");
        };

        assert_eq!(
            routes.calls.lock().await.as_slice(),
            &[format!("add {ip}/32 dev tun0")]
        );
    }

    #[tokio::test]
    async fn missing_tunnel_id_is_a_bad_request() {
        let alloc = allocator();
        let routes = NullRouteProgrammer::default();

        let req = RegisterRequest {
            contact: "bob".to_string(),
            from: "bob".to_string(),
            tunnel_id: None,
            is_server_agent: false,
            peer_addr: "10.0.0.9".parse().unwrap(),
        };

        let outcome = handle_register(&req, &alloc, &routes).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::BadRequest);
        assert!(routes.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn server_agent_register_routes_via_peer_address() {
        let alloc = allocator();
        let routes = NullRouteProgrammer::default();

        let req = RegisterRequest {
            contact: "gateway-b".to_string(),
            from: "gateway-b".to_string(),
            tunnel_id: Some("irrelevant".to_string()),
            is_server_agent: true,
            peer_addr: "10.5.5.5".parse().unwrap(),
        };

        let outcome = handle_register(&req, &alloc, &routes).await.unwrap();
        let RegisterOutcome::Ok(ip) = outcome else {
            panic!("expected Ok outcome");
        };

        assert_eq!(
            routes.calls.lock().await.as_slice(),
            &[format!("add {ip}/32 via 10.5.5.5")]
        );
    }
}

//! Self IP discovery for service registration.
//!
//! Two strategies are tried in a configurable order; the first one that yields
//! a usable address wins.

use std::net::{IpAddr, ToSocketAddrs, UdpSocket};

use serde::{Deserialize, Serialize};

/// Address used to pick the outbound interface. No packet is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Strategy for discovering the address other hosts can reach us on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpDiscovery {
    /// Resolve the machine's hostname and take the first non-loopback IPv4.
    Host,
    /// Local address of the interface that routes to the outside world.
    Internal,
}

impl IpDiscovery {
    /// Order used when the configuration does not specify one.
    pub const DEFAULT_ORDER: [Self; 2] = [Self::Host, Self::Internal];

    /// Run this strategy.
    pub fn discover(self) -> Option<IpAddr> {
        match self {
            Self::Host => host_ip(),
            Self::Internal => internal_ip(),
        }
    }
}

/// Try each strategy in `order`, returning the first address found.
pub fn detect_ip(order: &[IpDiscovery]) -> Option<IpAddr> {
    order.iter().find_map(|strategy| {
        let found = strategy.discover();
        tracing::debug!("IP discovery {strategy:?}: {found:?}");
        found
    })
}

fn host_ip() -> Option<IpAddr> {
    let name = hostname::get().ok()?.into_string().ok()?;
    (name.as_str(), 0)
        .to_socket_addrs()
        .ok()?
        .map(|addr| addr.ip())
        .find(|ip| ip.is_ipv4() && usable(*ip))
}

fn internal_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(ROUTE_PROBE_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    usable(ip).then_some(ip)
}

const fn usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

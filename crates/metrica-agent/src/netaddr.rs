//! Outbound address discovery for the `X-Real-IP` header.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

/// Routing lookup target. Connecting a UDP socket sends no packets.
const PROBE_TARGET: &str = "8.8.8.8:80";

/// Returns the local address the host would use to reach the network,
/// or loopback when there is no route.
pub fn outbound_ip() -> IpAddr {
    match local_ip_towards(PROBE_TARGET) {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            debug!(error = %e, "outbound address discovery failed, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn local_ip_towards(target: &str) -> io::Result<IpAddr> {
    let target: SocketAddr = target
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

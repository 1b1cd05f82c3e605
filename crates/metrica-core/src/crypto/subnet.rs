//! Trusted subnet check on the `X-Real-IP` header.

use std::net::IpAddr;
use std::str::FromStr;

use ip_network::IpNetwork;

use crate::error::MetricError;

/// Header carrying the client address, set by agents on every request.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Why a request failed the subnet check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    /// Header missing or not an IP address.
    #[error("invalid X-Real-IP header")]
    Malformed,
    /// Address outside the trusted subnet.
    #[error("address {0} is not in the trusted subnet")]
    Denied(IpAddr),
}

/// A single CIDR prefix. A bare address is treated as a host prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedSubnet {
    network: IpNetwork,
}

impl TrustedSubnet {
    pub fn network(&self) -> IpNetwork {
        self.network
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpNetwork::V4(net), IpAddr::V4(ip)) => net.contains(ip),
            (IpNetwork::V6(net), IpAddr::V6(ip)) => net.contains(ip),
            (IpNetwork::V6(net), IpAddr::V4(ip)) => net.contains(ip.to_ipv6_mapped()),
            (IpNetwork::V4(net), IpAddr::V6(ip)) => {
                ip.to_ipv4_mapped().is_some_and(|ip| net.contains(ip))
            }
        }
    }

    /// Validates the raw header value of one request.
    pub fn check(&self, header: Option<&str>) -> Result<IpAddr, SubnetError> {
        let ip = header
            .map(str::trim)
            .and_then(|s| IpAddr::from_str(s).ok())
            .ok_or(SubnetError::Malformed)?;
        if self.contains(ip) {
            Ok(ip)
        } else {
            Err(SubnetError::Denied(ip))
        }
    }
}

impl FromStr for TrustedSubnet {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let network = match IpNetwork::from_str(s) {
            Ok(net) => net,
            Err(e) => match IpAddr::from_str(s) {
                Ok(IpAddr::V4(ip4)) => IpNetwork::new(ip4, 32)
                    .map_err(|e| MetricError::parse(format!("invalid trusted subnet {s}: {e}")))?,
                Ok(IpAddr::V6(ip6)) => IpNetwork::new(ip6, 128)
                    .map_err(|e| MetricError::parse(format!("invalid trusted subnet {s}: {e}")))?,
                Err(_) => return Err(MetricError::parse(format!("invalid trusted subnet {s}: {e}"))),
            },
        };
        Ok(Self { network })
    }
}

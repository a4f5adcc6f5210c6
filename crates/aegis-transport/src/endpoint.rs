//! Endpoint and address model.
//!
//! An [`Endpoint`] names one reachable peer socket (IP protocol + socket
//! address, or a Bluetooth RFCOMM device + channel). An [`Address`] is the
//! host part alone, which access control and reputation key on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// IP transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    /// Stream transport
    Tcp,
    /// Datagram transport with its own reliability layer
    Udp,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A reachable peer socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// IPv4/IPv6 endpoint
    Ip {
        /// TCP or UDP
        protocol: IpProtocol,
        /// Socket address
        addr: SocketAddr,
    },
    /// Bluetooth RFCOMM endpoint
    Bth {
        /// 48-bit device address stored in the low bits
        addr: u64,
        /// RFCOMM channel
        port: u16,
    },
}

impl Endpoint {
    /// Shorthand for a TCP endpoint
    #[must_use]
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Ip {
            protocol: IpProtocol::Tcp,
            addr,
        }
    }

    /// Shorthand for a UDP endpoint
    #[must_use]
    pub fn udp(addr: SocketAddr) -> Self {
        Self::Ip {
            protocol: IpProtocol::Udp,
            addr,
        }
    }

    /// The host part of this endpoint
    #[must_use]
    pub fn address(&self) -> Address {
        match self {
            Self::Ip { addr, .. } => Address::Ip(addr.ip()),
            Self::Bth { addr, .. } => Address::Bth(*addr),
        }
    }

    /// The port / RFCOMM channel
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip { addr, .. } => addr.port(),
            Self::Bth { port, .. } => *port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip { protocol, addr } => write!(f, "{protocol}://{addr}"),
            Self::Bth { addr, port } => {
                write!(f, "bth://{}/{port}", format_bth(*addr))
            }
        }
    }
}

/// Endpoint parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint: {0}")]
pub struct EndpointParseError(String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || EndpointParseError(s.to_string());

        if let Some(rest) = s.strip_prefix("tcp://") {
            return rest.parse().map(Endpoint::tcp).map_err(|_| err());
        }
        if let Some(rest) = s.strip_prefix("udp://") {
            return rest.parse().map(Endpoint::udp).map_err(|_| err());
        }
        if let Some(rest) = s.strip_prefix("bth://") {
            let (addr_str, port_str) = rest.rsplit_once('/').ok_or_else(err)?;
            let addr = parse_bth(addr_str).ok_or_else(err)?;
            let port = port_str.parse().map_err(|_| err())?;
            return Ok(Endpoint::Bth { addr, port });
        }

        Err(err())
    }
}

/// The host part of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Address {
    /// IPv4 or IPv6 address
    Ip(IpAddr),
    /// 48-bit Bluetooth device address
    Bth(u64),
}

impl Address {
    /// True for IP addresses
    #[must_use]
    pub fn is_ip(&self) -> bool {
        matches!(self, Self::Ip(_))
    }

    /// The IP address, if this is one
    #[must_use]
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ip(ip) => Some(*ip),
            Self::Bth(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Bth(addr) => write!(f, "{}", format_bth(*addr)),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::Ip(ip)
    }
}

fn format_bth(addr: u64) -> String {
    let b = addr.to_be_bytes();
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        b[2], b[3], b[4], b[5], b[6], b[7]
    )
}

fn parse_bth(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut addr = 0u64;
    for part in parts {
        if part.len() != 2 {
            return None;
        }
        addr = (addr << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
    }
    Some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_endpoint_roundtrip() {
        let ep: Endpoint = "tcp://192.168.1.10:9999".parse().unwrap();
        assert_eq!(
            ep,
            Endpoint::tcp("192.168.1.10:9999".parse().unwrap())
        );
        assert_eq!(ep.to_string(), "tcp://192.168.1.10:9999");
        assert_eq!(ep.port(), 9999);
    }

    #[test]
    fn test_udp_ipv6_endpoint_roundtrip() {
        let ep: Endpoint = "udp://[::1]:443".parse().unwrap();
        assert_eq!(ep.to_string(), "udp://[::1]:443");
        assert_eq!(ep.address(), Address::Ip("::1".parse().unwrap()));
    }

    #[test]
    fn test_bth_endpoint_roundtrip() {
        let ep: Endpoint = "bth://92:5F:D3:5B:93:B2/9".parse().unwrap();
        match ep {
            Endpoint::Bth { addr, port } => {
                assert_eq!(addr, 0x925F_D35B_93B2);
                assert_eq!(port, 9);
            }
            Endpoint::Ip { .. } => panic!("expected bth endpoint"),
        }
        assert_eq!(ep.to_string(), "bth://92:5F:D3:5B:93:B2/9");
        let reparsed: Endpoint = ep.to_string().parse().unwrap();
        assert_eq!(reparsed, ep);
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!("192.168.1.1:80".parse::<Endpoint>().is_err());
        assert!("tcp://not-an-addr".parse::<Endpoint>().is_err());
        assert!("bth://92:5F/9".parse::<Endpoint>().is_err());
        assert!("bth://92:5F:D3:5B:93:B2".parse::<Endpoint>().is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_bth_roundtrip(addr in 0u64..(1 << 48), port in any::<u16>()) {
                let ep = Endpoint::Bth { addr, port };
                let parsed: Endpoint = ep.to_string().parse().unwrap();
                prop_assert_eq!(parsed, ep);
            }

            #[test]
            fn prop_parse_never_panics(s in ".{0,64}") {
                let _ = s.parse::<Endpoint>();
            }
        }
    }

    #[test]
    fn test_address_extraction() {
        let ep = Endpoint::tcp("10.0.0.1:80".parse().unwrap());
        assert_eq!(ep.address(), Address::Ip("10.0.0.1".parse().unwrap()));
        assert!(ep.address().is_ip());

        let bth = Endpoint::Bth {
            addr: 0xAABB_CCDD_EEFF,
            port: 1,
        };
        assert_eq!(bth.address(), Address::Bth(0xAABB_CCDD_EEFF));
        assert!(bth.address().as_ip().is_none());
    }
}

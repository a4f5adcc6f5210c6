//! Subnet connection caps.
//!
//! Caps the number of simultaneously connected peers per subnet of a
//! configured prefix length, per address family.

use aegis_transport::Address;
use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;

/// One configured cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetLimit {
    /// Prefix length defining the subnet granularity
    pub prefix_len: u8,
    /// Maximum simultaneous connections per such subnet
    pub max_connections: usize,
}

/// Per-family subnet caps plus the live connection bookkeeping
#[derive(Debug, Default)]
pub struct SubnetLimits {
    ipv4: Vec<SubnetLimit>,
    ipv6: Vec<SubnetLimit>,
    /// Simultaneous connection count per connected address
    connected: HashMap<Address, usize>,
}

impl SubnetLimits {
    /// Create with no caps configured
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cap for IPv4 (`prefix_len` ≤ 32) or IPv6 (`prefix_len` ≤ 128).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an out-of-range prefix length
    /// or a duplicate entry.
    pub fn add_ipv4(&mut self, prefix_len: u8, max_connections: usize) -> Result<()> {
        if prefix_len > 32 {
            return Err(Error::invalid_argument("IPv4 prefix length exceeds 32"));
        }
        if self.ipv4.iter().any(|l| l.prefix_len == prefix_len) {
            return Err(Error::invalid_argument("duplicate IPv4 subnet limit"));
        }
        self.ipv4.push(SubnetLimit {
            prefix_len,
            max_connections,
        });
        Ok(())
    }

    /// Add an IPv6 cap
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an out-of-range prefix length
    /// or a duplicate entry.
    pub fn add_ipv6(&mut self, prefix_len: u8, max_connections: usize) -> Result<()> {
        if prefix_len > 128 {
            return Err(Error::invalid_argument("IPv6 prefix length exceeds 128"));
        }
        if self.ipv6.iter().any(|l| l.prefix_len == prefix_len) {
            return Err(Error::invalid_argument("duplicate IPv6 subnet limit"));
        }
        self.ipv6.push(SubnetLimit {
            prefix_len,
            max_connections,
        });
        Ok(())
    }

    /// Remove a cap
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotFound`] if no such cap exists.
    pub fn remove_ipv4(&mut self, prefix_len: u8) -> Result<()> {
        let before = self.ipv4.len();
        self.ipv4.retain(|l| l.prefix_len != prefix_len);
        if self.ipv4.len() == before {
            return Err(Error::AddressNotFound);
        }
        Ok(())
    }

    /// Remove an IPv6 cap
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotFound`] if no such cap exists.
    pub fn remove_ipv6(&mut self, prefix_len: u8) -> Result<()> {
        let before = self.ipv6.len();
        self.ipv6.retain(|l| l.prefix_len != prefix_len);
        if self.ipv6.len() == before {
            return Err(Error::AddressNotFound);
        }
        Ok(())
    }

    fn count_in_subnet(&self, ip: IpAddr, prefix_len: u8) -> usize {
        let Ok(net) = IpNet::new(ip, prefix_len) else {
            return 0;
        };
        let net = net.trunc();
        self.connected
            .iter()
            .filter_map(|(addr, count)| match addr {
                Address::Ip(other) if net.contains(other) => Some(*count),
                _ => None,
            })
            .sum()
    }

    /// Whether admitting one more connection from `addr` stays within every
    /// matching cap. Bluetooth addresses have no subnet structure and always
    /// fit.
    #[must_use]
    pub fn can_accept(&self, addr: &Address) -> bool {
        let Address::Ip(ip) = addr else {
            return true;
        };
        let limits = if ip.is_ipv4() { &self.ipv4 } else { &self.ipv6 };
        for limit in limits {
            if self.count_in_subnet(*ip, limit.prefix_len) + 1 > limit.max_connections {
                return false;
            }
        }
        true
    }

    /// Record one established connection from `addr`
    pub fn connected(&mut self, addr: Address) {
        *self.connected.entry(addr).or_insert(0) += 1;
    }

    /// Record one closed connection from `addr`
    pub fn disconnected(&mut self, addr: &Address) {
        if let Some(count) = self.connected.get_mut(addr) {
            *count -= 1;
            if *count == 0 {
                self.connected.remove(addr);
            }
        }
    }

    /// Total connections currently tracked
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.connected.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Address {
        Address::Ip(s.parse::<IpAddr>().unwrap())
    }

    #[test]
    fn test_cap_enforced_per_subnet() {
        let mut limits = SubnetLimits::new();
        limits.add_ipv4(24, 2).unwrap();

        assert!(limits.can_accept(&ip("10.0.0.1")));
        limits.connected(ip("10.0.0.1"));
        assert!(limits.can_accept(&ip("10.0.0.2")));
        limits.connected(ip("10.0.0.2"));

        // Third connection in 10.0.0.0/24 exceeds the cap
        assert!(!limits.can_accept(&ip("10.0.0.3")));
        // A different /24 is unaffected
        assert!(limits.can_accept(&ip("10.0.1.1")));
    }

    #[test]
    fn test_disconnect_frees_slot() {
        let mut limits = SubnetLimits::new();
        limits.add_ipv4(16, 1).unwrap();

        limits.connected(ip("172.16.1.1"));
        assert!(!limits.can_accept(&ip("172.16.2.2")));

        limits.disconnected(&ip("172.16.1.1"));
        assert!(limits.can_accept(&ip("172.16.2.2")));
        assert_eq!(limits.total_connections(), 0);
    }

    #[test]
    fn test_multiple_connections_same_address() {
        let mut limits = SubnetLimits::new();
        limits.add_ipv4(24, 2).unwrap();

        limits.connected(ip("10.0.0.1"));
        limits.connected(ip("10.0.0.1"));
        assert!(!limits.can_accept(&ip("10.0.0.1")));

        limits.disconnected(&ip("10.0.0.1"));
        assert!(limits.can_accept(&ip("10.0.0.1")));
    }

    #[test]
    fn test_no_limits_accepts_everything() {
        let mut limits = SubnetLimits::new();
        for i in 0..100 {
            let addr = ip(&format!("10.0.0.{i}"));
            assert!(limits.can_accept(&addr));
            limits.connected(addr);
        }
    }

    #[test]
    fn test_ipv6_caps_independent() {
        let mut limits = SubnetLimits::new();
        limits.add_ipv6(48, 1).unwrap();

        limits.connected(ip("2001:db8:1::1"));
        assert!(!limits.can_accept(&ip("2001:db8:1::2")));
        assert!(limits.can_accept(&ip("2001:db8:2::1")));
        // IPv4 untouched by IPv6 caps
        assert!(limits.can_accept(&ip("10.0.0.1")));
    }

    #[test]
    fn test_bth_unlimited() {
        let mut limits = SubnetLimits::new();
        limits.add_ipv4(0, 0).unwrap();
        assert!(limits.can_accept(&Address::Bth(0xAABB_CCDD_EEFF)));
    }

    #[test]
    fn test_invalid_and_duplicate_limits() {
        let mut limits = SubnetLimits::new();
        assert!(limits.add_ipv4(33, 5).is_err());
        assert!(limits.add_ipv6(129, 5).is_err());
        limits.add_ipv4(24, 5).unwrap();
        assert!(limits.add_ipv4(24, 9).is_err());
        limits.remove_ipv4(24).unwrap();
        assert!(limits.remove_ipv4(24).is_err());
    }
}

//! Address filters.
//!
//! Allow/block entries scoped to an address family: CIDR prefixes for IP,
//! bit-length prefixes over the 48-bit device address for Bluetooth. Lookups
//! are longest-prefix-match; at equal length a block entry overrides an allow
//! entry.

use aegis_transport::Address;
use crate::error::{Error, Result};
use ipnet::IpNet;

/// Whether a filter admits or refuses matching addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Matching addresses are admitted
    Allowed,
    /// Matching addresses are refused
    Blocked,
}

const BTH_ADDR_BITS: u8 = 48;
const BTH_ADDR_MASK: u64 = (1 << BTH_ADDR_BITS) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct IpFilter {
    net: IpNet,
    access: AccessType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BthFilter {
    prefix: u64,
    len: u8,
    access: AccessType,
}

impl BthFilter {
    fn mask(len: u8) -> u64 {
        if len == 0 {
            0
        } else {
            (BTH_ADDR_MASK << (BTH_ADDR_BITS - len)) & BTH_ADDR_MASK
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr & Self::mask(self.len) == self.prefix
    }
}

/// Family-scoped allow/block filter lists
#[derive(Debug, Clone, Default)]
pub struct AddressFilters {
    ip: Vec<IpFilter>,
    bth: Vec<BthFilter>,
}

impl AddressFilters {
    /// Create empty filter lists
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter for the prefix of length `prefix_len` containing `addr`.
    ///
    /// Adding an entry that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a prefix length the family does
    /// not support.
    pub fn add(&mut self, addr: Address, prefix_len: u8, access: AccessType) -> Result<()> {
        match addr {
            Address::Ip(ip) => {
                let net = IpNet::new(ip, prefix_len)
                    .map_err(|_| Error::invalid_argument("prefix length out of range"))?
                    .trunc();
                let filter = IpFilter { net, access };
                if !self.ip.contains(&filter) {
                    self.ip.push(filter);
                }
            }
            Address::Bth(raw) => {
                if prefix_len > BTH_ADDR_BITS {
                    return Err(Error::invalid_argument("prefix length out of range"));
                }
                let filter = BthFilter {
                    prefix: raw & BTH_ADDR_MASK & BthFilter::mask(prefix_len),
                    len: prefix_len,
                    access,
                };
                if !self.bth.contains(&filter) {
                    self.bth.push(filter);
                }
            }
        }
        Ok(())
    }

    /// Remove a previously added filter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotFound`] if no matching entry exists and
    /// [`Error::InvalidArgument`] for an unsupported prefix length.
    pub fn remove(&mut self, addr: Address, prefix_len: u8, access: AccessType) -> Result<()> {
        match addr {
            Address::Ip(ip) => {
                let net = IpNet::new(ip, prefix_len)
                    .map_err(|_| Error::invalid_argument("prefix length out of range"))?
                    .trunc();
                let before = self.ip.len();
                self.ip.retain(|f| !(f.net == net && f.access == access));
                if self.ip.len() == before {
                    return Err(Error::AddressNotFound);
                }
            }
            Address::Bth(raw) => {
                if prefix_len > BTH_ADDR_BITS {
                    return Err(Error::invalid_argument("prefix length out of range"));
                }
                let prefix = raw & BTH_ADDR_MASK & BthFilter::mask(prefix_len);
                let before = self.bth.len();
                self.bth
                    .retain(|f| !(f.prefix == prefix && f.len == prefix_len && f.access == access));
                if self.bth.len() == before {
                    return Err(Error::AddressNotFound);
                }
            }
        }
        Ok(())
    }

    /// Longest-prefix-match lookup; `None` when no filter matches
    #[must_use]
    pub fn lookup(&self, addr: &Address) -> Option<AccessType> {
        let mut best_len: i16 = -1;
        let mut best = None;

        match addr {
            Address::Ip(ip) => {
                for f in &self.ip {
                    if !f.net.contains(ip) {
                        continue;
                    }
                    let len = i16::from(f.net.prefix_len());
                    if len > best_len {
                        best_len = len;
                        best = Some(f.access);
                    } else if len == best_len && f.access == AccessType::Blocked {
                        best = Some(AccessType::Blocked);
                    }
                }
            }
            Address::Bth(raw) => {
                let raw = raw & BTH_ADDR_MASK;
                for f in &self.bth {
                    if !f.contains(raw) {
                        continue;
                    }
                    let len = i16::from(f.len);
                    if len > best_len {
                        best_len = len;
                        best = Some(f.access);
                    } else if len == best_len && f.access == AccessType::Blocked {
                        best = Some(AccessType::Blocked);
                    }
                }
            }
        }
        best
    }

    /// Whether `addr` is admitted, with `default_allowed` deciding unmatched
    /// addresses
    #[must_use]
    pub fn is_allowed(&self, addr: &Address, default_allowed: bool) -> bool {
        match self.lookup(addr) {
            Some(AccessType::Allowed) => true,
            Some(AccessType::Blocked) => false,
            None => default_allowed,
        }
    }
}

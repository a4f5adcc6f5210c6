//! Access control.
//!
//! Three independent gates evaluated on every new inbound or outbound
//! connection and every relay-request hop:
//!
//! 1. address filters (allow/block lists, longest prefix wins),
//! 2. reputation with connection-attempt rate limiting,
//! 3. subnet connection caps.
//!
//! Each gate can also be queried on its own via [`AccessManager::check`].

pub mod filters;
pub mod limits;
pub mod reputation;

pub use filters::{AccessType, AddressFilters};
pub use limits::{SubnetLimit, SubnetLimits};
pub use reputation::{AttemptKind, ReputationTable, ReputationUpdate};

use aegis_transport::Address;
use crate::config::Settings;
use crate::error::{Error, Result};
use tokio::sync::RwLock;

/// Which gate to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// Address filters only
    Filters,
    /// Reputation only (no attempt charged)
    Reputation,
    /// Subnet caps only
    SubnetLimits,
    /// All gates in order
    All,
}

/// The access control layer
pub struct AccessManager {
    filters: RwLock<AddressFilters>,
    reputation: RwLock<ReputationTable>,
    limits: RwLock<SubnetLimits>,
    settings: Settings,
}

impl AccessManager {
    /// Create with the given startup settings
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            filters: RwLock::new(AddressFilters::new()),
            reputation: RwLock::new(ReputationTable::new()),
            limits: RwLock::new(SubnetLimits::new()),
            settings,
        }
    }

    /// Add an address filter
    ///
    /// # Errors
    ///
    /// Propagates [`AddressFilters::add`] failures.
    pub async fn add_filter(
        &self,
        addr: Address,
        prefix_len: u8,
        access: AccessType,
    ) -> Result<()> {
        self.filters.write().await.add(addr, prefix_len, access)
    }

    /// Remove an address filter
    ///
    /// # Errors
    ///
    /// Propagates [`AddressFilters::remove`] failures.
    pub async fn remove_filter(
        &self,
        addr: Address,
        prefix_len: u8,
        access: AccessType,
    ) -> Result<()> {
        self.filters.write().await.remove(addr, prefix_len, access)
    }

    /// Add a subnet cap
    ///
    /// # Errors
    ///
    /// Propagates [`SubnetLimits`] failures.
    pub async fn add_subnet_limit_ipv4(&self, prefix_len: u8, max: usize) -> Result<()> {
        self.limits.write().await.add_ipv4(prefix_len, max)
    }

    /// Add an IPv6 subnet cap
    ///
    /// # Errors
    ///
    /// Propagates [`SubnetLimits`] failures.
    pub async fn add_subnet_limit_ipv6(&self, prefix_len: u8, max: usize) -> Result<()> {
        self.limits.write().await.add_ipv6(prefix_len, max)
    }

    /// Current reputation score for an address
    pub async fn reputation(&self, addr: Address) -> i16 {
        self.reputation
            .write()
            .await
            .get(addr, self.settings.general.ip_reputation_improvement_interval)
    }

    /// Apply a reputation update, returning the new score
    pub async fn update_reputation(&self, addr: Address, update: ReputationUpdate) -> i16 {
        self.reputation.write().await.update(
            addr,
            update,
            self.settings.general.ip_reputation_improvement_interval,
        )
    }

    /// Force a reputation score
    ///
    /// # Errors
    ///
    /// Propagates [`ReputationTable::set`] failures.
    pub async fn set_reputation(&self, addr: Address, score: i16) -> Result<()> {
        self.reputation.write().await.set(addr, score)
    }

    /// Evaluate one gate (or all of them) without charging an attempt
    pub async fn check(&self, addr: &Address, check: CheckType) -> bool {
        let filters = || async { self.filters.read().await.is_allowed(addr, true) };
        let reputation = || async {
            let score = self.reputation.write().await.get(
                *addr,
                self.settings.general.ip_reputation_improvement_interval,
            );
            reputation::is_acceptable(score)
        };
        let limits = || async { self.limits.read().await.can_accept(addr) };

        match check {
            CheckType::Filters => filters().await,
            CheckType::Reputation => reputation().await,
            CheckType::SubnetLimits => limits().await,
            CheckType::All => filters().await && reputation().await && limits().await,
        }
    }

    /// Run the full admission sequence for a new connection or relay hop,
    /// charging one attempt against the address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessDenied`] when filters or reputation refuse the
    /// address and [`Error::NoMoreSlots`] when a subnet cap would be exceeded.
    pub async fn admit(&self, addr: &Address, kind: AttemptKind) -> Result<()> {
        if !self.filters.read().await.is_allowed(addr, true) {
            tracing::debug!(address = %addr, "refused by address filter");
            return Err(Error::AccessDenied);
        }

        let attempts = match kind {
            AttemptKind::Connection => &self.settings.general.ip_connection_attempts,
            AttemptKind::Relay => &self.settings.relay_security.connection_attempts,
        };
        let improvement = self.settings.general.ip_reputation_improvement_interval;
        let acceptable = {
            let mut reputation = self.reputation.write().await;
            reputation::is_acceptable(reputation.get(*addr, improvement))
                && reputation.add_attempt(
                    *addr,
                    kind,
                    attempts.interval,
                    attempts.max_per_interval,
                    improvement,
                )
        };
        if !acceptable {
            tracing::debug!(address = %addr, "refused by reputation");
            return Err(Error::AccessDenied);
        }

        if !self.limits.read().await.can_accept(addr) {
            tracing::debug!(address = %addr, "refused by subnet limit");
            return Err(Error::NoMoreSlots);
        }

        Ok(())
    }

    /// Record an established connection for subnet accounting
    pub async fn connected(&self, addr: Address) {
        self.limits.write().await.connected(addr);
    }

    /// Record a closed connection for subnet accounting
    pub async fn disconnected(&self, addr: &Address) {
        self.limits.write().await.disconnected(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::time::Duration;

    fn ip(s: &str) -> Address {
        Address::Ip(s.parse::<IpAddr>().unwrap())
    }

    fn manager() -> AccessManager {
        AccessManager::new(Settings::default())
    }

    #[tokio::test]
    async fn test_fresh_address_admitted() {
        let mgr = manager();
        mgr.admit(&ip("1.2.3.4"), AttemptKind::Connection)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_filter_refuses() {
        let mgr = manager();
        mgr.add_filter(ip("192.168.0.0"), 16, AccessType::Blocked)
            .await
            .unwrap();

        assert_eq!(
            mgr.admit(&ip("192.168.1.1"), AttemptKind::Connection).await,
            Err(Error::AccessDenied)
        );
        assert!(!mgr.check(&ip("192.168.1.1"), CheckType::Filters).await);
        assert!(mgr.check(&ip("10.0.0.1"), CheckType::Filters).await);
    }

    #[tokio::test]
    async fn test_attempt_rate_deteriorates_and_blocks() {
        let mut settings = Settings::default();
        settings.general.ip_connection_attempts.max_per_interval = 5;
        settings.general.ip_connection_attempts.interval = Duration::from_secs(10);
        let mgr = AccessManager::new(settings);
        let addr = ip("6.6.6.6");

        for _ in 0..5 {
            mgr.admit(&addr, AttemptKind::Connection).await.unwrap();
        }
        // Sixth attempt within the window is charged and deteriorates the score
        let _ = mgr.admit(&addr, AttemptKind::Connection).await;
        assert!(
            mgr.reputation(addr).await
                <= reputation::SCORE_MAXIMUM + ReputationUpdate::DeteriorateModerate as i16
        );

        // Keep hammering until the score is gone, then admission fails
        for _ in 0..10 {
            let _ = mgr.admit(&addr, AttemptKind::Connection).await;
        }
        assert_eq!(
            mgr.admit(&addr, AttemptKind::Connection).await,
            Err(Error::AccessDenied)
        );
    }

    #[tokio::test]
    async fn test_subnet_cap_returns_no_more_slots() {
        let mgr = manager();
        mgr.add_subnet_limit_ipv4(24, 1).await.unwrap();

        mgr.admit(&ip("10.0.0.1"), AttemptKind::Connection)
            .await
            .unwrap();
        mgr.connected(ip("10.0.0.1")).await;

        assert_eq!(
            mgr.admit(&ip("10.0.0.2"), AttemptKind::Connection).await,
            Err(Error::NoMoreSlots)
        );

        mgr.disconnected(&ip("10.0.0.1")).await;
        mgr.admit(&ip("10.0.0.2"), AttemptKind::Connection)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_checks() {
        let mgr = manager();
        let addr = ip("7.7.7.7");
        assert!(mgr.check(&addr, CheckType::Filters).await);
        assert!(mgr.check(&addr, CheckType::Reputation).await);
        assert!(mgr.check(&addr, CheckType::SubnetLimits).await);
        assert!(mgr.check(&addr, CheckType::All).await);

        mgr.set_reputation(addr, reputation::SCORE_BASE).await.unwrap();
        assert!(!mgr.check(&addr, CheckType::Reputation).await);
        assert!(!mgr.check(&addr, CheckType::All).await);
        // Other gates unaffected
        assert!(mgr.check(&addr, CheckType::Filters).await);
    }
}

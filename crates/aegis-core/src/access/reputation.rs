//! Address reputation.
//!
//! Every address carries a signed score. Protocol violations deteriorate it;
//! elapsed time improves it linearly back toward the maximum. An address is
//! acceptable while its score stays above the base value. Connection-attempt
//! counters (normal and relay) live alongside the score so exceeding the
//! configured attempt rate deteriorates the same entry.

use aegis_transport::Address;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lowest reachable score
pub const SCORE_MINIMUM: i16 = -3000;
/// Highest reachable score; fresh addresses start here
pub const SCORE_MAXIMUM: i16 = 100;
/// Threshold: an address is acceptable while score > base
pub const SCORE_BASE: i16 = 0;

/// Reputation adjustments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ReputationUpdate {
    /// No change
    None = 0,
    /// Time-based recovery step
    ImproveMinimal = 20,
    /// Minor violation (extender rejections)
    DeteriorateMinimal = -20,
    /// Moderate violation (rate exceeded, stale frames)
    DeteriorateModerate = -50,
    /// Severe violation (authentication or replay failure)
    DeteriorateSevere = -200,
}

/// Which attempt counter to charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// Direct inbound/outbound connections
    Connection,
    /// Relay hops
    Relay,
}

#[derive(Debug, Clone)]
struct Attempts {
    amount: usize,
    last_reset: Instant,
}

impl Attempts {
    fn new() -> Self {
        Self {
            amount: 0,
            last_reset: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct AddressDetails {
    score: i16,
    last_improve: Instant,
    connection_attempts: Attempts,
    relay_attempts: Attempts,
}

impl AddressDetails {
    fn new() -> Self {
        Self {
            score: SCORE_MAXIMUM,
            last_improve: Instant::now(),
            connection_attempts: Attempts::new(),
            relay_attempts: Attempts::new(),
        }
    }

    fn improve(&mut self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let elapsed = self.last_improve.elapsed();
        let periods = (elapsed.as_secs() / interval.as_secs().max(1)) as i64;
        if periods < 1 {
            return;
        }
        let new_score = i64::from(self.score) + i64::from(ReputationUpdate::ImproveMinimal as i16) * periods;
        self.score = new_score.min(i64::from(SCORE_MAXIMUM)) as i16;
        self.last_improve = Instant::now();
    }

    fn apply(&mut self, update: ReputationUpdate) -> i16 {
        let new_score = i32::from(self.score) + i32::from(update as i16);
        self.score = new_score.clamp(i32::from(SCORE_MINIMUM), i32::from(SCORE_MAXIMUM)) as i16;
        self.score
    }
}

/// Whether a score admits the address
#[must_use]
pub fn is_acceptable(score: i16) -> bool {
    score > SCORE_BASE
}

/// Per-address reputation and attempt tracking
#[derive(Debug, Default)]
pub struct ReputationTable {
    entries: HashMap<Address, AddressDetails>,
}

impl ReputationTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply time-based improvement then a reputation update; returns the new
    /// score. Creates the entry on first sight.
    pub fn update(
        &mut self,
        addr: Address,
        update: ReputationUpdate,
        improvement_interval: Duration,
    ) -> i16 {
        let entry = self.entries.entry(addr).or_insert_with(AddressDetails::new);
        entry.improve(improvement_interval);
        entry.apply(update)
    }

    /// Current score after applying time-based improvement
    pub fn get(&mut self, addr: Address, improvement_interval: Duration) -> i16 {
        let entry = self.entries.entry(addr).or_insert_with(AddressDetails::new);
        entry.improve(improvement_interval);
        entry.score
    }

    /// Force a score, for administrative use
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a score outside the limits.
    pub fn set(&mut self, addr: Address, score: i16) -> Result<()> {
        if !(SCORE_MINIMUM..=SCORE_MAXIMUM).contains(&score) {
            return Err(Error::invalid_argument("reputation score out of range"));
        }
        let entry = self.entries.entry(addr).or_insert_with(AddressDetails::new);
        entry.score = score;
        entry.last_improve = Instant::now();
        Ok(())
    }

    /// Restore an address to the maximum score
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressNotFound`] for an untracked address.
    pub fn reset(&mut self, addr: &Address) -> Result<()> {
        let entry = self
            .entries
            .get_mut(addr)
            .ok_or(Error::AddressNotFound)?;
        entry.score = SCORE_MAXIMUM;
        entry.last_improve = Instant::now();
        Ok(())
    }

    /// Restore every tracked address to the maximum score
    pub fn reset_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.score = SCORE_MAXIMUM;
            entry.last_improve = Instant::now();
        }
    }

    /// Charge one connection attempt inside the sliding window.
    ///
    /// Exceeding `max_per_interval` applies
    /// [`ReputationUpdate::DeteriorateModerate`]. Returns whether the address
    /// is still acceptable afterwards.
    pub fn add_attempt(
        &mut self,
        addr: Address,
        kind: AttemptKind,
        interval: Duration,
        max_per_interval: usize,
        improvement_interval: Duration,
    ) -> bool {
        let entry = self.entries.entry(addr).or_insert_with(AddressDetails::new);
        let attempts = match kind {
            AttemptKind::Connection => &mut entry.connection_attempts,
            AttemptKind::Relay => &mut entry.relay_attempts,
        };

        if attempts.last_reset.elapsed() >= interval {
            attempts.amount = 0;
            attempts.last_reset = Instant::now();
        }
        attempts.amount = attempts.amount.saturating_add(1);

        if attempts.amount > max_per_interval {
            entry.improve(improvement_interval);
            let score = entry.apply(ReputationUpdate::DeteriorateModerate);
            tracing::warn!(
                address = %addr,
                score,
                "connection attempt rate exceeded, reputation deteriorated"
            );
            return is_acceptable(score);
        }
        true
    }

    /// Number of tracked addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no address is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    const IMPROVE: Duration = Duration::from_secs(600);

    fn ip(s: &str) -> Address {
        Address::Ip(s.parse::<IpAddr>().unwrap())
    }

    #[test]
    fn test_fresh_address_is_acceptable() {
        let mut table = ReputationTable::new();
        let score = table.get(ip("1.2.3.4"), IMPROVE);
        assert_eq!(score, SCORE_MAXIMUM);
        assert!(is_acceptable(score));
    }

    #[test]
    fn test_deterioration_steps() {
        let mut table = ReputationTable::new();
        let addr = ip("1.2.3.4");

        assert_eq!(
            table.update(addr, ReputationUpdate::DeteriorateMinimal, IMPROVE),
            80
        );
        assert_eq!(
            table.update(addr, ReputationUpdate::DeteriorateModerate, IMPROVE),
            30
        );
        assert_eq!(
            table.update(addr, ReputationUpdate::DeteriorateSevere, IMPROVE),
            -170
        );
        assert!(!is_acceptable(table.get(addr, IMPROVE)));
    }

    #[test]
    fn test_score_clamped_to_limits() {
        let mut table = ReputationTable::new();
        let addr = ip("5.6.7.8");

        for _ in 0..100 {
            table.update(addr, ReputationUpdate::DeteriorateSevere, IMPROVE);
        }
        assert_eq!(table.get(addr, IMPROVE), SCORE_MINIMUM);

        table.set(addr, SCORE_MAXIMUM).unwrap();
        assert_eq!(
            table.update(addr, ReputationUpdate::ImproveMinimal, IMPROVE),
            SCORE_MAXIMUM
        );
    }

    #[test]
    fn test_time_improvement() {
        let mut table = ReputationTable::new();
        let addr = ip("9.9.9.9");
        table.set(addr, 0).unwrap();

        // Zero-length improvement interval would divide the elapsed time by
        // zero; the table treats it as "no improvement configured"
        let fast = Duration::from_secs(1);
        std::thread::sleep(Duration::from_millis(1100));
        let score = table.get(addr, fast);
        assert_eq!(score, ReputationUpdate::ImproveMinimal as i16);
        assert!(is_acceptable(score));
    }

    #[test]
    fn test_set_rejects_out_of_range() {
        let mut table = ReputationTable::new();
        assert!(table.set(ip("1.1.1.1"), SCORE_MINIMUM - 1).is_err());
        assert!(table.set(ip("1.1.1.1"), SCORE_MAXIMUM + 1).is_err());
    }

    #[test]
    fn test_reset() {
        let mut table = ReputationTable::new();
        let addr = ip("2.2.2.2");
        table.update(addr, ReputationUpdate::DeteriorateSevere, IMPROVE);

        table.reset(&addr).unwrap();
        assert_eq!(table.get(addr, IMPROVE), SCORE_MAXIMUM);

        assert_eq!(
            table.reset(&ip("3.3.3.3")),
            Err(Error::AddressNotFound)
        );
    }

    #[test]
    fn test_attempt_rate_limit() {
        let mut table = ReputationTable::new();
        let addr = ip("4.4.4.4");
        let window = Duration::from_secs(10);

        for _ in 0..5 {
            assert!(table.add_attempt(addr, AttemptKind::Connection, window, 5, IMPROVE));
        }
        // Sixth attempt exceeds the maximum and deteriorates the score
        table.add_attempt(addr, AttemptKind::Connection, window, 5, IMPROVE);
        assert_eq!(
            table.get(addr, IMPROVE),
            SCORE_MAXIMUM + ReputationUpdate::DeteriorateModerate as i16
        );
    }

    #[test]
    fn test_attempt_window_resets() {
        let mut table = ReputationTable::new();
        let addr = ip("4.4.4.5");
        let window = Duration::from_millis(50);

        for _ in 0..3 {
            assert!(table.add_attempt(addr, AttemptKind::Connection, window, 3, IMPROVE));
        }
        std::thread::sleep(Duration::from_millis(60));
        // Window elapsed: fresh budget, no deterioration
        assert!(table.add_attempt(addr, AttemptKind::Connection, window, 3, IMPROVE));
        assert_eq!(table.get(addr, IMPROVE), SCORE_MAXIMUM);
    }

    #[test]
    fn test_relay_attempts_counted_separately() {
        let mut table = ReputationTable::new();
        let addr = ip("4.4.4.6");
        let window = Duration::from_secs(10);

        for _ in 0..3 {
            assert!(table.add_attempt(addr, AttemptKind::Connection, window, 3, IMPROVE));
        }
        // Relay budget untouched by connection attempts
        assert!(table.add_attempt(addr, AttemptKind::Relay, window, 3, IMPROVE));
        assert_eq!(table.get(addr, IMPROVE), SCORE_MAXIMUM);
    }

    #[test]
    fn test_repeated_deterioration_blocks_until_improved() {
        let mut table = ReputationTable::new();
        let addr = ip("7.7.7.7");
        let window = Duration::from_secs(10);

        let mut admitted = true;
        for _ in 0..10 {
            admitted = table.add_attempt(addr, AttemptKind::Connection, window, 2, IMPROVE);
        }
        assert!(!admitted);
        assert!(!is_acceptable(table.get(addr, IMPROVE)));
    }
}

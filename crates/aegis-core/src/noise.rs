//! Noise traffic generation.
//!
//! When enabled, each peer emits between `min_messages_per_interval` and
//! `max_messages_per_interval` Ping frames per `time_interval`, each with a
//! random payload in the configured size range. Fire times are drawn
//! uniformly across the interval rather than bursted at its start. Noise is
//! suppressed while a peer is suspended.

use crate::config::NoiseSettings;
use crate::stats::OnlineVariance;
use std::time::{Duration, Instant};

/// Per-peer noise scheduler
pub struct NoiseGenerator {
    settings: NoiseSettings,
    interval_start: Instant,
    /// Remaining fire times for the current interval, latest first
    pending: Vec<Instant>,
    last_fire: Option<Instant>,
    gap_stats: OnlineVariance,
}

impl NoiseGenerator {
    /// Create a scheduler; the first interval starts now
    #[must_use]
    pub fn new(settings: NoiseSettings) -> Self {
        let mut generator = Self {
            settings,
            interval_start: Instant::now(),
            pending: Vec::new(),
            last_fire: None,
            gap_stats: OnlineVariance::new(),
        };
        generator.schedule_interval();
        generator
    }

    /// Derive noise settings from a bandwidth target.
    ///
    /// Picks the largest message size not exceeding `max_message_size` for
    /// which at least one message per interval fits the budget, then sizes
    /// the message counts so the interval traffic lands between
    /// `min_bandwidth` and `max_bandwidth` bytes. With `saturate` the
    /// minimum equals the maximum and the target bandwidth is always spent.
    #[must_use]
    pub fn bandwidth_driven(
        time_interval: Duration,
        min_bandwidth: u64,
        max_bandwidth: u64,
        max_message_size: usize,
        saturate: bool,
    ) -> NoiseSettings {
        let budget = max_bandwidth.saturating_mul(time_interval.as_secs().max(1));
        let mut message_size = max_message_size.max(1);
        while message_size > 1 && budget / message_size as u64 == 0 {
            message_size /= 2;
        }
        let max_messages = (budget / message_size as u64) as usize;
        let min_messages = if saturate {
            max_messages
        } else if max_bandwidth == 0 {
            0
        } else {
            (max_messages as u64 * min_bandwidth / max_bandwidth) as usize
        };

        NoiseSettings {
            enabled: max_messages > 0,
            time_interval,
            min_messages_per_interval: min_messages,
            max_messages_per_interval: max_messages,
            min_message_size: 0,
            max_message_size: message_size,
        }
    }

    fn schedule_interval(&mut self) {
        self.pending.clear();
        if !self.settings.enabled {
            return;
        }
        let count = aegis_crypto::random::range(
            self.settings.min_messages_per_interval,
            self.settings.max_messages_per_interval,
        );
        let interval_millis = self.settings.time_interval.as_millis() as u64;
        for _ in 0..count {
            let offset = aegis_crypto::random::range(0, interval_millis.saturating_sub(1) as usize);
            self.pending
                .push(self.interval_start + Duration::from_millis(offset as u64));
        }
        // Latest first so due times pop off the back
        self.pending.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Advance to the next interval when the current one has elapsed
    fn roll_interval(&mut self, now: Instant) {
        while now.duration_since(self.interval_start) >= self.settings.time_interval {
            self.interval_start += self.settings.time_interval;
            self.schedule_interval();
        }
    }

    /// Whether a noise frame is due; `suspended` suppresses all noise
    pub fn take_due(&mut self, suspended: bool) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let now = Instant::now();
        self.roll_interval(now);
        if suspended {
            // Suppressed frames are consumed, not deferred
            while self.pending.last().is_some_and(|t| *t <= now) {
                self.pending.pop();
            }
            return false;
        }
        if self.pending.last().is_some_and(|t| *t <= now) {
            self.pending.pop();
            if let Some(last) = self.last_fire {
                self.gap_stats.add(now.duration_since(last).as_secs_f64());
            }
            self.last_fire = Some(now);
            return true;
        }
        false
    }

    /// Random payload size per the configured policy
    #[must_use]
    pub fn payload_size(&self) -> usize {
        aegis_crypto::random::range(
            self.settings.min_message_size,
            self.settings.max_message_size,
        )
    }

    /// Frames still scheduled in the current interval
    #[must_use]
    pub fn pending_in_interval(&self) -> usize {
        self.pending.len()
    }

    /// Observed gap statistics between emitted frames
    #[must_use]
    pub fn gap_stats(&self) -> &OnlineVariance {
        &self.gap_stats
    }
}

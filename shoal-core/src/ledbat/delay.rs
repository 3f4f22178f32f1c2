//! One-way delay tracking (RFC 6817 §4.1–4.2).
//!
//! Delays are signed milliseconds: the sender and receiver clocks are not synchronised, so a
//! one-way delay sample carries an unknown constant offset that cancels out when the base delay
//! is subtracted.

use std::time::{Duration, Instant};

use crate::config::LedbatConfig;

/// Sentinel for an empty slot. Any real sample is smaller, so the first sample always becomes
/// the new minimum.
const EMPTY_DELAY: i64 = i64::MAX;

const BASE_ROLLOVER: Duration = Duration::from_secs(60);

pub struct DelayHistory {
    target_ms: i64,
    /// Recent samples, always overwritten in a ring.
    current: Vec<i64>,
    current_idx: usize,
    /// One minimum per minute.
    base: Vec<i64>,
    base_idx: usize,
    last_rollover: Option<Instant>,
}

impl DelayHistory {
    pub fn new(config: &LedbatConfig) -> Self {
        Self {
            target_ms: config.target_ms as i64,
            current: vec![EMPTY_DELAY; config.current_filter.max(1)],
            current_idx: 0,
            base: vec![EMPTY_DELAY; config.base_history.max(2)],
            base_idx: 0,
            last_rollover: None,
        }
    }

    pub fn reset(&mut self) {
        self.current.fill(EMPTY_DELAY);
        self.base.fill(EMPTY_DELAY);
        self.current_idx = 0;
        self.base_idx = 0;
        self.last_rollover = None;
    }

    pub fn update(&mut self, now: Instant, one_way_delay_ms: i64) {
        self.current[self.current_idx] = one_way_delay_ms;
        self.current_idx = (self.current_idx + 1) % self.current.len();

        match self.last_rollover {
            Some(last) if now.saturating_duration_since(last) < BASE_ROLLOVER => {
                let slot = &mut self.base[self.base_idx];
                *slot = (*slot).min(one_way_delay_ms);
            }
            Some(_) => {
                // Seed the new minute with the smallest sample still in the current filter so the
                // base never rises above a delay that queuing_delay() still looks at.
                self.base_idx = (self.base_idx + 1) % self.base.len();
                self.base[self.base_idx] = min_of(&self.current);
                self.last_rollover = Some(now);
            }
            None => {
                self.base[self.base_idx] = one_way_delay_ms;
                self.last_rollover = Some(now);
            }
        }
    }

    /// `min(current) - min(base)` in milliseconds; zero before the first sample.
    pub fn queuing_delay(&self) -> i64 {
        let current = min_of(&self.current);
        let base = min_of(&self.base);
        if current == EMPTY_DELAY || base == EMPTY_DELAY {
            return 0;
        }
        current - base
    }

    pub fn base_delay(&self) -> Option<i64> {
        Some(min_of(&self.base)).filter(|d| *d != EMPTY_DELAY)
    }

    /// `(TARGET - queuing_delay) / TARGET`. Negative once queuing exceeds the target.
    pub fn off_target(&self, queuing_delay_ms: i64) -> f64 {
        (self.target_ms - queuing_delay_ms) as f64 / self.target_ms as f64
    }
}

fn min_of(slots: &[i64]) -> i64 {
    slots.iter().copied().min().unwrap_or(EMPTY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> DelayHistory {
        DelayHistory::new(&LedbatConfig::default())
    }

    #[test]
    fn no_samples_means_no_queuing() {
        let h = history();
        assert_eq!(h.queuing_delay(), 0);
        assert_eq!(h.base_delay(), None);
    }

    #[test]
    fn queuing_is_current_minus_base() {
        let now = Instant::now();
        let mut h = history();
        h.update(now, 40);
        for _ in 0..4 {
            h.update(now, 90);
        }
        assert_eq!(h.base_delay(), Some(40));
        assert_eq!(h.queuing_delay(), 50);
        assert!((h.off_target(50) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn negative_offsets_cancel_out() {
        let now = Instant::now();
        let mut h = history();
        h.update(now, -5_000);
        h.update(now, -4_980);
        assert_eq!(h.queuing_delay(), 0);
        for _ in 0..4 {
            h.update(now, -4_980);
        }
        assert_eq!(h.queuing_delay(), 20);
    }

    #[test]
    fn off_target_negative_above_target() {
        let h = history();
        assert!(h.off_target(150) < 0.0);
    }

    #[test]
    fn base_survives_rollover_and_never_exceeds_current() {
        let start = Instant::now();
        let mut h = history();
        h.update(start, 10);
        // Sparse samples: the filter still holds 10 when the next minute starts.
        h.update(start + Duration::from_secs(61), 70);
        assert_eq!(h.base_delay(), Some(10));
        assert!(h.queuing_delay() >= 0);
        for i in 0..30 {
            h.update(start + Duration::from_secs(120 + 61 * i), 70);
            assert!(h.queuing_delay() >= 0);
        }
        // Old minima have rolled out of the history.
        assert_eq!(h.base_delay(), Some(70));
        assert_eq!(h.queuing_delay(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut h = history();
        h.update(Instant::now(), 10);
        h.reset();
        assert_eq!(h.base_delay(), None);
        h.update(Instant::now(), 500);
        assert_eq!(h.base_delay(), Some(500));
    }
}

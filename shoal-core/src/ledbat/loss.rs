//! Loss detection policies: decide whether a loss event may shrink the window.

use std::time::{Duration, Instant};

use crate::config::LossPolicy;

/// Enum dispatch over the available policies.
#[derive(Debug, Clone)]
pub enum LossController {
    Simple(SimpleLoss),
    Percentage(PercentageLoss),
}

impl LossController {
    pub fn from_policy(policy: LossPolicy) -> Self {
        match policy {
            LossPolicy::Simple => LossController::Simple(SimpleLoss::default()),
            LossPolicy::Percentage { threshold } => {
                LossController::Percentage(PercentageLoss::new(threshold))
            }
        }
    }

    pub fn on_ack(&mut self, now: Instant, rtt: Duration) {
        match self {
            LossController::Simple(_) => {}
            LossController::Percentage(p) => p.on_ack(now, rtt),
        }
    }

    /// Returns true if this loss should reduce the window.
    pub fn on_loss(&mut self, now: Instant, rtt: Duration) -> bool {
        match self {
            LossController::Simple(s) => s.on_loss(now, rtt),
            LossController::Percentage(p) => p.on_loss(now, rtt),
        }
    }
}

/// At most one reduction per RTT.
#[derive(Debug, Clone, Default)]
pub struct SimpleLoss {
    last_reduction: Option<Instant>,
}

impl SimpleLoss {
    fn on_loss(&mut self, now: Instant, rtt: Duration) -> bool {
        match self.last_reduction {
            Some(last) if now.saturating_duration_since(last) < rtt => false,
            _ => {
                self.last_reduction = Some(now);
                true
            }
        }
    }
}

/// Counts acks and losses over one-RTT windows; reacts once per window when the loss ratio
/// reaches `threshold`.
#[derive(Debug, Clone)]
pub struct PercentageLoss {
    threshold: f64,
    window_start: Option<Instant>,
    acks: u32,
    losses: u32,
    reacted: bool,
}

impl PercentageLoss {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            window_start: None,
            acks: 0,
            losses: 0,
            reacted: false,
        }
    }

    fn roll(&mut self, now: Instant, rtt: Duration) {
        let expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= rtt,
            None => true,
        };
        if expired {
            self.window_start = Some(now);
            self.acks = 0;
            self.losses = 0;
            self.reacted = false;
        }
    }

    fn on_ack(&mut self, now: Instant, rtt: Duration) {
        self.roll(now, rtt);
        self.acks += 1;
    }

    fn on_loss(&mut self, now: Instant, rtt: Duration) -> bool {
        self.roll(now, rtt);
        self.losses += 1;
        let ratio = self.losses as f64 / (self.acks + self.losses) as f64;
        if !self.reacted && ratio >= self.threshold {
            self.reacted = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTT: Duration = Duration::from_millis(100);

    #[test]
    fn simple_reacts_once_per_rtt() {
        let now = Instant::now();
        let mut c = LossController::from_policy(LossPolicy::Simple);
        assert!(c.on_loss(now, RTT));
        assert!(!c.on_loss(now + Duration::from_millis(50), RTT));
        assert!(c.on_loss(now + Duration::from_millis(100), RTT));
    }

    #[test]
    fn percentage_needs_threshold() {
        let now = Instant::now();
        let mut c = LossController::from_policy(LossPolicy::Percentage { threshold: 0.25 });
        for _ in 0..9 {
            c.on_ack(now, RTT);
        }
        // 1 of 10 lost: below 25%.
        assert!(!c.on_loss(now, RTT));
        assert!(!c.on_loss(now, RTT));
        // 3 of 12: at 25%.
        assert!(c.on_loss(now, RTT));
        // Already reacted in this window.
        assert!(!c.on_loss(now, RTT));
    }

    #[test]
    fn percentage_window_rolls_over() {
        let now = Instant::now();
        let mut c = LossController::from_policy(LossPolicy::Percentage { threshold: 0.5 });
        assert!(c.on_loss(now, RTT));
        assert!(!c.on_loss(now, RTT));
        assert!(c.on_loss(now + RTT, RTT));
    }
}

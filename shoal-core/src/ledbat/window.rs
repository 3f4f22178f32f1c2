//! LEDBAT congestion window.
//!
//! Growth is proportional to how far the queuing delay sits below target, so the window yields
//! before the bottleneck queue overflows. Loss halves the window, subject to the loss policy.
//!
//! With `multi_pane` enabled the window is also split into time panes of `min_rto` width across
//! one RTT. Each pane may only hold `cwnd / active_panes` bytes in flight, which spreads an RTT's
//! allowance over the whole round trip instead of one send burst.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::LedbatConfig;

use super::delay::DelayHistory;
use super::loss::LossController;
use super::MsgId;

/// Snapshot of the window for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub cwnd: u64,
    pub flight_size: u64,
    pub queuing_delay_ms: i64,
    pub total_increases: u64,
    pub total_decreases: u64,
    pub total_losses: u64,
    pub loss_reductions: u64,
}

#[derive(Debug, Default)]
struct Panes {
    flight: HashMap<u64, u64>,
    msg_pane: HashMap<MsgId, u64>,
}

pub struct CongestionWindow {
    mss: u64,
    min_window: u64,
    gain: f64,
    dtl_beta: f64,
    allowed_increase: u64,
    min_rto: Duration,
    cwnd: f64,
    flight_size: u64,
    delay: DelayHistory,
    loss: LossController,
    panes: Option<Panes>,
    epoch: Instant,
    total_increases: u64,
    total_decreases: u64,
    total_losses: u64,
    loss_reductions: u64,
}

impl CongestionWindow {
    pub fn new(config: &LedbatConfig, now: Instant) -> Self {
        Self {
            mss: config.mss,
            min_window: config.min_window(),
            gain: config.gain,
            dtl_beta: config.dtl_beta,
            allowed_increase: config.allowed_increase,
            min_rto: config.min_rto().max(Duration::from_millis(1)),
            cwnd: config.init_window().max(config.min_window()) as f64,
            flight_size: 0,
            delay: DelayHistory::new(config),
            loss: LossController::from_policy(config.loss_policy),
            panes: config.multi_pane.then(Panes::default),
            epoch: now,
            total_increases: 0,
            total_decreases: 0,
            total_losses: 0,
            loss_reductions: 0,
        }
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd as u64
    }

    pub fn flight_size(&self) -> u64 {
        self.flight_size
    }

    pub fn can_send(&self, now: Instant, rtt: Duration, bytes: u64) -> bool {
        let cwnd = self.cwnd();
        if self.flight_size + bytes > cwnd {
            return false;
        }
        match &self.panes {
            None => true,
            Some(panes) => {
                let pane = self.pane_index(now, rtt);
                let pane_flight = panes.flight.get(&pane).copied().unwrap_or(0);
                pane_flight + bytes <= cwnd / self.active_panes(rtt)
            }
        }
    }

    pub fn on_send(&mut self, msg_id: MsgId, now: Instant, rtt: Duration, bytes: u64) {
        self.flight_size += bytes;
        let pane = self.pane_index(now, rtt);
        if let Some(panes) = &mut self.panes {
            *panes.flight.entry(pane).or_insert(0) += bytes;
            panes.msg_pane.insert(msg_id, pane);
        }
    }

    pub fn on_ack(
        &mut self,
        msg_id: MsgId,
        now: Instant,
        rtt: Duration,
        one_way_delay_ms: i64,
        bytes_acked: u64,
    ) {
        self.loss.on_ack(now, rtt);
        self.delay.update(now, one_way_delay_ms);
        let queuing_delay = self.delay.queuing_delay();
        let off_target = self.delay.off_target(queuing_delay);

        let before = self.cwnd;
        let pre_ack_flight = self.flight_size;
        let mut cwnd = if off_target < 0.0 {
            before * self.dtl_beta
        } else {
            before + self.gain * off_target * bytes_acked as f64 * self.mss as f64 / before
        };
        let max_allowed = (pre_ack_flight + self.allowed_increase * self.mss) as f64;
        cwnd = cwnd.min(max_allowed).max(self.min_window as f64);
        self.cwnd = cwnd;

        if cwnd > before {
            self.total_increases += 1;
        } else if cwnd < before {
            self.total_decreases += 1;
        }
        tracing::trace!(
            msg_id,
            old_cwnd = before as u64,
            new_cwnd = cwnd as u64,
            queuing_delay_ms = queuing_delay,
            off_target,
            flight_size = pre_ack_flight,
            "LEDBAT cwnd update"
        );
        self.release(msg_id, bytes_acked);
    }

    pub fn on_loss(&mut self, msg_id: MsgId, now: Instant, rtt: Duration, bytes_lost: u64) {
        self.total_losses += 1;
        if self.loss.on_loss(now, rtt) {
            let before = self.cwnd;
            self.cwnd = (before / 2.0).max(self.min_window as f64);
            self.loss_reductions += 1;
            tracing::warn!(
                msg_id,
                old_cwnd = before as u64,
                new_cwnd = self.cwnd as u64,
                total_losses = self.total_losses,
                "LEDBAT loss - halving cwnd"
            );
        }
        self.release(msg_id, bytes_lost);
    }

    pub fn queuing_delay_ms(&self) -> i64 {
        self.delay.queuing_delay()
    }

    /// In-flight bytes charged to the pane that is current at `now`.
    pub fn pane_flight(&self, now: Instant, rtt: Duration) -> Option<u64> {
        let panes = self.panes.as_ref()?;
        Some(panes.flight.get(&self.pane_index(now, rtt)).copied().unwrap_or(0))
    }

    /// Number of panes across one RTT, at least one and at most one per MSS of window.
    pub fn active_panes(&self, rtt: Duration) -> u64 {
        let by_time = (rtt.as_millis() / self.min_rto.as_millis()) as u64;
        let by_window = (self.cwnd() / self.mss).max(1);
        by_time.clamp(1, by_window)
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            cwnd: self.cwnd(),
            flight_size: self.flight_size,
            queuing_delay_ms: self.delay.queuing_delay(),
            total_increases: self.total_increases,
            total_decreases: self.total_decreases,
            total_losses: self.total_losses,
            loss_reductions: self.loss_reductions,
        }
    }

    fn pane_index(&self, now: Instant, rtt: Duration) -> u64 {
        let rtt_ms = rtt.as_millis().max(1);
        let elapsed_ms = now.saturating_duration_since(self.epoch).as_millis();
        let pane = (elapsed_ms % rtt_ms) / self.min_rto.as_millis();
        (pane as u64).min(self.active_panes(rtt) - 1)
    }

    fn release(&mut self, msg_id: MsgId, bytes: u64) {
        self.flight_size = self.flight_size.saturating_sub(bytes);
        if let Some(panes) = &mut self.panes {
            if let Some(pane) = panes.msg_pane.remove(&msg_id) {
                if let Some(flight) = panes.flight.get_mut(&pane) {
                    *flight = flight.saturating_sub(bytes);
                    if *flight == 0 {
                        panes.flight.remove(&pane);
                    }
                }
            }
        }
    }
}

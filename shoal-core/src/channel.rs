//! Reliable datum channel: admits outbound units through the congestion window, times them out
//! and matches acknowledgements.
//!
//! One channel serves one peer direction. Payloads stay owned by the channel while in flight and
//! are handed back either on ack (to process the response) or on timeout (to re-queue the work).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::LedbatConfig;
use crate::ledbat::{CongestionWindow, MsgId, RttEstimator};
use crate::timer::{TimerHandle, Timers};

struct InFlight<T> {
    payload: T,
    bytes: u64,
    sent_at: Instant,
    timer: TimerHandle,
}

pub struct ReliableDatumChannel<T> {
    window: CongestionWindow,
    rtt: RttEstimator,
    queue: VecDeque<(T, u64)>,
    in_flight: HashMap<MsgId, InFlight<T>>,
    timers: Timers<MsgId>,
    next_msg_id: MsgId,
    consecutive_timeouts: u32,
}

impl<T: Clone> ReliableDatumChannel<T> {
    pub fn new(config: &LedbatConfig, now: Instant) -> Self {
        Self::with_initial_msg_id(config, now, rand::random::<u32>() as MsgId)
    }

    pub fn with_initial_msg_id(config: &LedbatConfig, now: Instant, first: MsgId) -> Self {
        Self {
            window: CongestionWindow::new(config, now),
            rtt: RttEstimator::new(config.min_rto(), config.max_rto()),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            timers: Timers::new(),
            next_msg_id: first,
            consecutive_timeouts: 0,
        }
    }

    /// Buffer a unit whose response is expected to be `bytes` long.
    pub fn push(&mut self, payload: T, bytes: u64) {
        self.queue.push_back((payload, bytes));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Pop every buffered unit the window admits and start its retransmission timer.
    ///
    /// A unit larger than the whole window is still sent when nothing else is in flight, so a
    /// small window cannot stall the channel.
    pub fn poll_send(&mut self, now: Instant) -> Vec<(MsgId, T)> {
        let mut sent = Vec::new();
        let rtt = self.rtt.rtt();
        while let Some((_, bytes)) = self.queue.front() {
            let bytes = *bytes;
            let lone = self.window.flight_size() == 0;
            if !lone && !self.window.can_send(now, rtt, bytes) {
                break;
            }
            let Some((payload, bytes)) = self.queue.pop_front() else {
                break;
            };
            let msg_id = self.next_msg_id;
            self.next_msg_id = self.next_msg_id.wrapping_add(1);
            self.window.on_send(msg_id, now, rtt, bytes);
            let timer = self.timers.schedule(now + self.rtt.rto(), msg_id);
            self.in_flight.insert(
                msg_id,
                InFlight {
                    payload: payload.clone(),
                    bytes,
                    sent_at: now,
                    timer,
                },
            );
            sent.push((msg_id, payload));
        }
        sent
    }

    /// Match an acknowledgement. Unknown ids (late, duplicate or already timed out) yield None.
    pub fn on_ack(&mut self, now: Instant, msg_id: MsgId, one_way_delay_ms: i64) -> Option<T> {
        let Some(entry) = self.in_flight.remove(&msg_id) else {
            tracing::debug!(msg_id, "ack for unknown datum ignored");
            return None;
        };
        self.timers.cancel(entry.timer);
        self.rtt.on_sample(now.saturating_duration_since(entry.sent_at));
        self.window
            .on_ack(msg_id, now, self.rtt.rtt(), one_way_delay_ms, entry.bytes);
        self.consecutive_timeouts = 0;
        Some(entry.payload)
    }

    /// Remove every datum whose timer fired. Each is counted as one loss and returned once.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let mut lost = Vec::new();
        for (_, msg_id) in self.timers.expired(now) {
            let Some(entry) = self.in_flight.remove(&msg_id) else {
                continue;
            };
            self.window.on_loss(msg_id, now, self.rtt.rtt(), entry.bytes);
            self.rtt.backoff();
            self.consecutive_timeouts += 1;
            tracing::debug!(
                msg_id,
                rto_ms = self.rtt.rto().as_millis() as u64,
                consecutive = self.consecutive_timeouts,
                "datum timed out"
            );
            lost.push(entry.payload);
        }
        lost
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn window(&self) -> &CongestionWindow {
        &self.window
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn close(&mut self) {
        self.queue.clear();
        self.in_flight.clear();
        self.timers.clear();
    }
}

//! Best-effort request sender: a fixed number of retries at a fixed interval, then a local
//! timeout signal. No congestion control; meant for small control messages.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::timer::Timers;

/// What the owner must do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffortEvent<T> {
    /// Put the request on the wire again.
    Resend { req_id: u64, payload: T },
    /// Retries exhausted; the request is dropped.
    Timeout { req_id: u64, payload: T },
}

struct Outstanding<T> {
    payload: T,
    retries_left: u32,
    retry_interval: Duration,
}

pub struct BestEffort<T> {
    outstanding: HashMap<u64, Outstanding<T>>,
    timers: Timers<u64>,
    next_req_id: u64,
}

impl<T: Clone> BestEffort<T> {
    pub fn new() -> Self {
        Self {
            outstanding: HashMap::new(),
            timers: Timers::new(),
            next_req_id: 1,
        }
    }

    /// Track a request that was just sent. Returns its id for the wire.
    pub fn send(&mut self, now: Instant, payload: T, retries: u32, retry_interval: Duration) -> u64 {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.outstanding.insert(
            req_id,
            Outstanding {
                payload,
                retries_left: retries,
                retry_interval,
            },
        );
        self.timers.schedule(now + retry_interval, req_id);
        req_id
    }

    /// The peer answered. Returns the payload, or None for an unknown or finished request.
    pub fn on_response(&mut self, req_id: u64) -> Option<T> {
        // The timer entry is left to fire into nothing.
        self.outstanding.remove(&req_id).map(|o| o.payload)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<BestEffortEvent<T>> {
        let mut events = Vec::new();
        for (_, req_id) in self.timers.expired(now) {
            let Some(entry) = self.outstanding.get_mut(&req_id) else {
                continue;
            };
            if entry.retries_left == 0 {
                if let Some(entry) = self.outstanding.remove(&req_id) {
                    events.push(BestEffortEvent::Timeout {
                        req_id,
                        payload: entry.payload,
                    });
                }
                continue;
            }
            entry.retries_left -= 1;
            let payload = entry.payload.clone();
            let deadline = now + entry.retry_interval;
            self.timers.schedule(deadline, req_id);
            events.push(BestEffortEvent::Resend { req_id, payload });
        }
        events
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
        self.timers.clear();
    }
}

impl<T: Clone> Default for BestEffort<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(500);

    #[test]
    fn retries_then_times_out() {
        let now = Instant::now();
        let mut be = BestEffort::new();
        let id = be.send(now, "hint", 2, INTERVAL);

        assert!(be.tick(now + Duration::from_millis(100)).is_empty());
        assert_eq!(
            be.tick(now + INTERVAL),
            vec![BestEffortEvent::Resend { req_id: id, payload: "hint" }]
        );
        assert_eq!(be.tick(now + INTERVAL * 2).len(), 1);
        assert_eq!(
            be.tick(now + INTERVAL * 3),
            vec![BestEffortEvent::Timeout { req_id: id, payload: "hint" }]
        );
        assert_eq!(be.outstanding(), 0);
        assert!(be.tick(now + INTERVAL * 10).is_empty());
    }

    #[test]
    fn response_stops_retries() {
        let now = Instant::now();
        let mut be = BestEffort::new();
        let id = be.send(now, 7u32, 3, INTERVAL);
        assert_eq!(be.on_response(id), Some(7));
        assert_eq!(be.on_response(id), None);
        assert!(be.tick(now + INTERVAL * 5).is_empty());
    }

    #[test]
    fn ids_are_distinct() {
        let now = Instant::now();
        let mut be = BestEffort::new();
        let a = be.send(now, (), 0, INTERVAL);
        let b = be.send(now, (), 0, INTERVAL);
        assert_ne!(a, b);
        be.clear();
        assert!(be.next_deadline().is_none());
    }
}

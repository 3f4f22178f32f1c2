//! Deadline-ordered timers with generation-checked handles.
//!
//! Every scheduled timer gets a fresh handle. Cancelling removes it, so a cancelled timer can
//! never fire, and a fired timer is gone, so cancelling it afterwards is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Handle to one scheduled timer. Never reused within a `Timers` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

pub struct Timers<T> {
    queue: BTreeMap<(Instant, TimerHandle), T>,
    deadlines: HashMap<TimerHandle, Instant>,
    next_generation: u64,
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_generation: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        let handle = TimerHandle(self.next_generation);
        self.next_generation += 1;
        self.queue.insert((deadline, handle), payload);
        self.deadlines.insert(handle, deadline);
        handle
    }

    /// Cancel a pending timer. Returns its payload, or None if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle)?;
        self.queue.remove(&(deadline, handle))
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle)
    }

    /// Remove and return every timer with `deadline <= now`, earliest first.
    pub fn expired(&mut self, now: Instant) -> Vec<(TimerHandle, T)> {
        let mut fired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (deadline, handle) = *entry.key();
            if deadline > now {
                break;
            }
            let payload = entry.remove();
            self.deadlines.remove(&handle);
            fired.push((handle, payload));
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(d, _)| *d)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}

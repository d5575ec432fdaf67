//! Deferred callbacks for the controller loop.
//!
//! Every piece of future work ("start this run at T", "check again in 20s",
//! "fail the check if it has not replied in 16s") is an entry in one
//! [`EventLoop`]. Payloads are plain data; the owner of the loop pops due
//! payloads and routes them, so no closure ever captures controller state.
//!
//! The clock is owned by the loop. The async driver advances it from a real
//! monotonic clock; tests advance it by hand.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Handle to a scheduled payload. Cancelling it before it fires drops the
/// payload; cancelling afterwards is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Callback(u64);

#[derive(Debug)]
pub struct EventLoop<T> {
    origin: DateTime<Utc>,
    elapsed: Duration,
    next_id: u64,
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    pending: HashMap<u64, T>,
}

impl<T> EventLoop<T> {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            elapsed: Duration::ZERO,
            next_id: 0,
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Wall-clock time as seen by the loop. Saturates at the end of the
    /// representable calendar.
    pub fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed)
            .ok()
            .and_then(|d| self.origin.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Deadlines past the end of the clock saturate and never fire.
    pub fn call_later(&mut self, delay: Duration, payload: T) -> Callback {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((self.elapsed.saturating_add(delay), id)));
        self.pending.insert(id, payload);
        Callback(id)
    }

    /// Schedule at a wall-clock time. Times in the past fire on the next turn.
    pub fn call_at(&mut self, when: DateTime<Utc>, payload: T) -> Callback {
        let delay = (when - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.call_later(delay, payload)
    }

    /// Returns true if the callback was still pending.
    pub fn cancel(&mut self, callback: Callback) -> bool {
        self.pending.remove(&callback.0).is_some()
    }

    pub fn is_active(&self, callback: Callback) -> bool {
        self.pending.contains_key(&callback.0)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Delay until the earliest live entry, discarding cancelled heads.
    pub fn until_next(&mut self) -> Option<Duration> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.pending.contains_key(&id) {
                return Some(deadline.saturating_sub(self.elapsed));
            }
            self.heap.pop();
        }
        None
    }

    pub fn advance(&mut self, by: Duration) {
        self.elapsed = self.elapsed.saturating_add(by);
    }

    /// Move the clock forward to `elapsed`; never moves it backwards.
    pub fn advance_to(&mut self, elapsed: Duration) {
        self.elapsed = self.elapsed.max(elapsed);
    }

    /// Pop the next payload whose deadline has passed, in deadline order and
    /// by scheduling order for equal deadlines.
    pub fn pop_due(&mut self) -> Option<T> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > self.elapsed {
                return None;
            }
            self.heap.pop();
            if let Some(payload) = self.pending.remove(&id) {
                return Some(payload);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_loop() -> EventLoop<&'static str> {
        EventLoop::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut el = new_loop();
        el.call_later(Duration::from_secs(20), "monitor");
        el.call_later(Duration::from_secs(16), "hang-check");
        el.advance(Duration::from_secs(30));
        assert_eq!(el.pop_due(), Some("hang-check"));
        assert_eq!(el.pop_due(), Some("monitor"));
        assert_eq!(el.pop_due(), None);
    }

    #[test]
    fn nothing_fires_early() {
        let mut el = new_loop();
        el.call_later(Duration::from_secs(5), "later");
        el.advance(Duration::from_secs(4));
        assert_eq!(el.pop_due(), None);
        assert_eq!(el.until_next(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn equal_deadlines_fire_in_scheduling_order() {
        let mut el = new_loop();
        el.call_later(Duration::ZERO, "first");
        el.call_later(Duration::ZERO, "second");
        assert_eq!(el.pop_due(), Some("first"));
        assert_eq!(el.pop_due(), Some("second"));
    }

    #[test]
    fn cancelled_callbacks_never_fire() {
        let mut el = new_loop();
        let cb = el.call_later(Duration::from_secs(1), "cancelled");
        assert!(el.is_active(cb));
        assert!(el.cancel(cb));
        assert!(!el.is_active(cb));
        assert!(!el.cancel(cb));
        el.advance(Duration::from_secs(2));
        assert_eq!(el.pop_due(), None);
        assert_eq!(el.until_next(), None);
    }

    #[test]
    fn call_at_in_the_past_is_due_now() {
        let mut el = new_loop();
        let past = el.now() - chrono::Duration::hours(1);
        el.call_at(past, "overdue");
        assert_eq!(el.pop_due(), Some("overdue"));
    }

    #[test]
    fn now_follows_the_clock() {
        let mut el = new_loop();
        let start = el.now();
        el.advance(Duration::from_secs(90));
        assert_eq!(el.now() - start, chrono::Duration::seconds(90));
        el.advance_to(Duration::from_secs(10));
        assert_eq!(el.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn huge_delays_saturate_instead_of_overflowing() {
        let mut el = new_loop();
        el.advance(Duration::from_secs(10));
        el.call_later(Duration::MAX, "never");
        el.call_later(Duration::from_secs(u64::MAX), "never either");
        el.advance(Duration::from_secs(3600));
        assert_eq!(el.pop_due(), None);
        assert_eq!(el.pending_count(), 2);

        el.advance(Duration::MAX);
        assert_eq!(el.now(), DateTime::<Utc>::MAX_UTC);
        el.call_at(el.now(), "at the end");
    }
}

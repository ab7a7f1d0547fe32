// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tick-based timer wheel.
//!
//! All protocol timeouts run on a 10 ms tick (100 ticks per second). The
//! wheel is driven from the event loop: `advance` moves the clock and hands
//! back every expired timer with its user data. Cancelled timers are
//! removed lazily.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Ticks per second; 1 tick = 10 ms.
pub const TICKS_PER_SEC: u64 = 100;

/// Duration of one tick.
pub const TICK: Duration = Duration::from_millis(10);

/// Convert whole seconds to ticks.
pub const fn secs(s: u64) -> u64 {
    s * TICKS_PER_SEC
}

/// Timer identity; never reused within one wheel.
pub type TimerId = u64;

/// Timer wheel carrying per-timer user data `T`.
#[derive(Debug)]
pub struct TimerWheel<T> {
    now: u64,
    next_id: TimerId,
    deadlines: BinaryHeap<Reverse<(u64, TimerId)>>,
    armed: HashMap<TimerId, T>,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        TimerWheel {
            now: 0,
            next_id: 1,
            deadlines: BinaryHeap::new(),
            armed: HashMap::new(),
        }
    }
}

impl<T> TimerWheel<T> {
    /// Empty wheel at tick 0.
    pub fn new() -> Self {
        TimerWheel::default()
    }

    /// Current tick.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.armed.len()
    }

    /// Arm a timer `delay` ticks from now.
    pub fn arm(&mut self, delay: u64, data: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.deadlines.push(Reverse((self.now + delay, id)));
        self.armed.insert(id, data);
        id
    }

    /// Disarm a timer. Returns its data if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.armed.remove(&id)
    }

    /// Ticks until the next live deadline, if any.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.armed.contains_key(&id) {
                return Some(deadline.saturating_sub(self.now));
            }
            // Cancelled; drop lazily.
            self.deadlines.pop();
        }
        None
    }

    /// Advance the clock by `ticks`, returning every expired timer.
    pub fn advance(&mut self, ticks: u64) -> Vec<(TimerId, T)> {
        self.now += ticks;
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > self.now {
                break;
            }
            self.deadlines.pop();
            if let Some(data) = self.armed.remove(&id) {
                fired.push((id, data));
            }
        }
        fired
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_and_fire() {
        let mut w: TimerWheel<&str> = TimerWheel::new();
        w.arm(10, "a");
        w.arm(20, "b");

        assert!(w.advance(5).is_empty());
        let fired = w.advance(5);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "a");
        let fired = w.advance(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, "b");
        assert_eq!(w.armed(), 0);
    }

    #[test]
    fn test_cancel() {
        let mut w: TimerWheel<u32> = TimerWheel::new();
        let id = w.arm(10, 1);
        w.arm(10, 2);

        assert_eq!(w.cancel(id), Some(1));
        let fired = w.advance(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].1, 2);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let mut w: TimerWheel<u32> = TimerWheel::new();
        let early = w.arm(5, 1);
        w.arm(50, 2);

        assert_eq!(w.next_deadline(), Some(5));
        w.cancel(early);
        assert_eq!(w.next_deadline(), Some(50));
    }

    #[test]
    fn test_same_deadline_ordering() {
        let mut w: TimerWheel<u32> = TimerWheel::new();
        w.arm(10, 1);
        w.arm(10, 2);
        let fired = w.advance(10);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_secs_conversion() {
        assert_eq!(secs(2), 200);
        assert_eq!(TICK.as_millis(), 10);
    }
}

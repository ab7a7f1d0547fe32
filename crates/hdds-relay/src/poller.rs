// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event loop core.
//!
//! One `mio::Poll` serves every socket; one timer wheel serves every
//! protocol timer. All protocol state advances inside the dispatch of one
//! `poll_once` call, never concurrently. The poll timeout follows the next
//! timer deadline so timers fire without busy-waiting.

use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::timer::{TimerId, TimerWheel, TICK};

/// Token reserved for the waker.
pub const WAKER_TOKEN: Token = Token(0);

/// First token handed to sockets.
const TOKEN_START: usize = 1;

/// Poll ceiling when no timer is armed.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Events processed per poll round.
const MAX_EVENTS: usize = 128;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct IoReady {
    /// Registered token.
    pub token: Token,
    /// Socket readable.
    pub readable: bool,
    /// Socket writable.
    pub writable: bool,
}

/// Socket registration handle shared with the transports: a registry
/// clone plus the loop-wide token allocator.
pub struct Registrar {
    registry: Registry,
    next: Rc<Cell<usize>>,
}

impl Registrar {
    /// Register a source with a fresh token.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        interests: Interest,
    ) -> io::Result<Token> {
        let token = Token(self.next.get());
        self.next.set(token.0 + 1);
        self.registry.register(source, token, interests)?;
        Ok(token)
    }

    /// Change a source's interest mask.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interests)
    }

    /// Remove a source from the poll set.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }
}

impl std::fmt::Debug for Registrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar")
            .field("next_token", &self.next.get())
            .finish()
    }
}

/// The poll/timer core; `T` tags timers with their owner.
pub struct Poller<T> {
    poll: Poll,
    events: Events,
    waker: Waker,
    next_token: Rc<Cell<usize>>,
    wheel: TimerWheel<T>,
    last_advance: Instant,
}

impl<T> Poller<T> {
    /// Create the poll instance and waker.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Poller {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            waker,
            next_token: Rc::new(Cell::new(TOKEN_START)),
            wheel: TimerWheel::new(),
            last_advance: Instant::now(),
        })
    }

    /// Registry for socket (de)registration.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registration handle for a transport.
    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar {
            registry: self.poll.registry().try_clone()?,
            next: self.next_token.clone(),
        })
    }

    /// Allocate a fresh token.
    pub fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token.get());
        self.next_token.set(t.0 + 1);
        t
    }

    /// Wake a blocked `poll_once` (used by embedding threads to push
    /// commands in).
    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Arm a timer `delay` ticks from now.
    pub fn arm_timer(&mut self, delay: u64, tag: T) -> TimerId {
        self.wheel.arm(delay, tag)
    }

    /// Disarm a timer.
    pub fn cancel_timer(&mut self, id: TimerId) -> Option<T> {
        self.wheel.cancel(id)
    }

    /// Number of armed timers.
    pub fn armed_timers(&self) -> usize {
        self.wheel.armed()
    }

    /// Run one poll round: readiness events plus expired timers.
    pub fn poll_once(&mut self) -> io::Result<(Vec<IoReady>, Vec<(TimerId, T)>)> {
        let timeout = self
            .wheel
            .next_deadline()
            .map_or(IDLE_POLL, |ticks| TICK * ticks as u32)
            .min(IDLE_POLL);

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut ready = Vec::new();
        for event in &self.events {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            ready.push(IoReady {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
            });
        }

        // Advance the wheel by wall-clock ticks since the last round.
        let elapsed = self.last_advance.elapsed();
        let ticks = (elapsed.as_millis() / TICK.as_millis()) as u64;
        let fired = if ticks > 0 {
            self.last_advance += TICK * ticks as u32;
            self.wheel.advance(ticks)
        } else {
            Vec::new()
        };

        Ok((ready, fired))
    }
}

/// Interest mask helper for read/write flags.
pub fn interest(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocation_monotonic() {
        let mut p: Poller<u32> = Poller::new().unwrap();
        let a = p.alloc_token();
        let b = p.alloc_token();
        assert_ne!(a, WAKER_TOKEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_timer_fires_through_poll() {
        let mut p: Poller<&str> = Poller::new().unwrap();
        p.arm_timer(1, "t");

        // Within a couple of rounds the 10 ms timer must fire.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (_ready, fired) = p.poll_once().unwrap();
            if fired.iter().any(|(_, tag)| *tag == "t") {
                break;
            }
            assert!(Instant::now() < deadline, "timer never fired");
        }
        assert_eq!(p.armed_timers(), 0);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mut p: Poller<&str> = Poller::new().unwrap();
        let id = p.arm_timer(1, "t");
        assert_eq!(p.cancel_timer(id), Some("t"));

        std::thread::sleep(Duration::from_millis(30));
        let (_ready, fired) = p.poll_once().unwrap();
        assert!(fired.is_empty());
    }

    #[test]
    fn test_interest_mask() {
        assert!(interest(false, false).is_none());
        assert_eq!(interest(true, false), Some(Interest::READABLE));
        assert_eq!(
            interest(true, true),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn test_wake() {
        let p: Poller<u32> = Poller::new().unwrap();
        assert!(p.wake().is_ok());
    }
}

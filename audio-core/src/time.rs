//! Monotonic time shared by every part of the crate.
//!
//! The original engine this crate's design is descended from mixed a 35 Hz
//! tick counter and a free-running real-time millisecond counter across
//! adjacent fields of the same records, which is a classic source of subtle
//! drift and (eventually, after ~50 days uptime) overflow bugs. Here there is
//! a single monotonic millisecond source; ticks are always derived from it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Ticks per second, matching the original engine's fixed simulation rate.
/// Only used for priority decay (see [`crate::listener::Listener::rate_sound_priority`]).
pub const TICKRATE: u64 = 35;

/// A process-wide monotonic millisecond clock. Cheap to read (`Instant`
/// subtraction), cheap to share (`Arc`-free — callers hold a value, not a
/// reference), and never overflows within the lifetime of a process.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since this clock was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Ticks elapsed since this clock was created, at [`TICKRATE`] Hz.
    pub fn now_tick(&self) -> i64 {
        ms_to_tick(self.now_ms())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ms_to_tick(ms: u64) -> i64 {
    ((ms * TICKRATE) / 1000) as i64
}

pub fn tick_to_ms(tick: i64) -> u64 {
    (tick.max(0) as u64 * 1000) / TICKRATE
}

/// A shareable, atomically-backed handle on the same clock, for components
/// that need `Clone + Send + Sync` without reaching for an `Arc<Mutex<_>>`.
#[derive(Debug)]
pub struct SharedClock {
    clock: MonotonicClock,
    last_tick: AtomicU64,
}

impl SharedClock {
    pub fn new() -> Self {
        Self {
            clock: MonotonicClock::new(),
            last_tick: AtomicU64::new(0),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn now_tick(&self) -> i64 {
        self.clock.now_tick()
    }

    /// Records the tick of the most recent frame-begin, for components that
    /// want "now" without resampling the clock themselves.
    pub fn mark_frame(&self) -> i64 {
        let t = self.now_tick();
        self.last_tick.store(t as u64, Ordering::Relaxed);
        t
    }

    pub fn last_frame_tick(&self) -> i64 {
        self.last_tick.load(Ordering::Relaxed) as i64
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_ms_roundtrip_is_stable() {
        for ms in [0u64, 1000, 5000, 123456] {
            let tick = ms_to_tick(ms);
            let back = tick_to_ms(tick);
            // Integer division means this isn't exact, but should never be
            // more than one tick's worth of ms off.
            assert!((back as i64 - ms as i64).unsigned_abs() <= 1000 / TICKRATE);
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_ms();
        assert!(b >= a);
    }
}

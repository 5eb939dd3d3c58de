//! Fence bounded nanosecond timing.
//!
//! Every duration is taken between two full memory fences so that the timed
//! access (or call) cannot be reordered out of the window. A clock that goes
//! backwards yields a zero duration, never a wrapped one.

use core::sync::atomic::{compiler_fence, fence, Ordering};
use std::cell::Cell;
use std::hint::black_box;

use nix::time::{clock_gettime, ClockId};

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MONOTONIC_CLOCK_ID: ClockId = ClockId::CLOCK_MONOTONIC_RAW;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MONOTONIC_CLOCK_ID: ClockId = ClockId::CLOCK_MONOTONIC;

pub trait Clock {
    /// Monotonic timestamp in nanoseconds.
    fn timestamp(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn timestamp(&self) -> u64 {
        (**self).timestamp()
    }
}

/// `CLOCK_MONOTONIC_RAW`, immune to NTP slewing and wall clock steps.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    id: ClockId,
}

impl MonotonicClock {
    pub fn new() -> Result<Self, nix::Error> {
        clock_gettime(MONOTONIC_CLOCK_ID)?;
        Ok(Self {
            id: MONOTONIC_CLOCK_ID,
        })
    }
}

impl Clock for MonotonicClock {
    fn timestamp(&self) -> u64 {
        match clock_gettime(self.id) {
            Ok(ts) => ts.tv_sec() as u64 * NANOS_PER_SEC + ts.tv_nsec() as u64,
            // The clock answered in new(), losing it mid run leaves nothing to measure with.
            Err(e) => panic!("monotonic clock became unavailable: {}", e),
        }
    }
}

pub fn elapsed(start: u64, end: u64) -> u64 {
    end.saturating_sub(start)
}

fn fenced<C: Clock + ?Sized, R>(clock: &C, op: impl FnOnce() -> R) -> (u64, R, u64) {
    fence(Ordering::SeqCst);
    let start = clock.timestamp();
    compiler_fence(Ordering::SeqCst);
    let r = op();
    fence(Ordering::SeqCst);
    let end = clock.timestamp();
    compiler_fence(Ordering::SeqCst);
    (start, r, end)
}

/// Runs `op` inside a fenced timing window, returns `max(0, end - start)`.
pub fn measure<C: Clock + ?Sized, R>(clock: &C, op: impl FnOnce() -> R) -> (u64, R) {
    let (start, r, end) = fenced(clock, op);
    (elapsed(start, end), r)
}

/// Accumulates every probed value so the reads stay observable and cannot be
/// removed as dead code.
#[derive(Debug, Default)]
pub struct ObservationSink {
    acc: Cell<u64>,
}

impl ObservationSink {
    pub fn observe(&self, value: u8) {
        self.acc
            .set(black_box(self.acc.get().wrapping_add(value as u64)));
    }

    pub fn value(&self) -> u64 {
        self.acc.get()
    }
}

/// A clock together with the observation sink for the reads it times.
#[derive(Debug)]
pub struct Timer<C: Clock> {
    clock: C,
    sink: ObservationSink,
    wraparounds: Cell<u64>,
}

impl<C: Clock> Timer<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            sink: ObservationSink::default(),
            wraparounds: Cell::new(0),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn sink(&self) -> &ObservationSink {
        &self.sink
    }

    pub fn time<R>(&self, op: impl FnOnce() -> R) -> (u64, R) {
        let (start, r, end) = fenced(&self.clock, op);
        if end < start {
            self.wraparounds.set(self.wraparounds.get() + 1);
            log::trace!("clock went backwards ({} -> {}), clamped to 0", start, end);
        }
        (elapsed(start, end), r)
    }

    /// Times a single read; the value read goes to the sink.
    pub fn time_read(&self, read: impl FnOnce() -> u8) -> u64 {
        let (t, value) = self.time(read);
        self.sink.observe(value);
        t
    }

    /// Number of clamped samples since the last call.
    pub fn take_wraparounds(&self) -> u64 {
        self.wraparounds.replace(0)
    }
}

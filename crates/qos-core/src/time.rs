//! Defines a [`Time`] trait used to abstract over the different ways a
//! timestamp can be created. This lets the state machines run against tokio
//! time in production and a hand-cranked clock in tests.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A timestamp with `Instant` for precise time measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Calculate the saturating duration since an earlier timestamp.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0
            .checked_duration_since(earlier.0)
            .unwrap_or_else(|| Duration::from_secs(0))
    }

    /// Create a new `Timestamp` from the current `Instant`.
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    /// Millisecond tick count relative to `epoch`, wrapping at `u32::MAX`.
    ///
    /// Probe timings travel to the coordinator as 32 bit millisecond ticks,
    /// only differences between ticks from the same epoch are meaningful.
    pub fn ticks_since(&self, epoch: Timestamp) -> u32 {
        self.duration_since(epoch).as_millis() as u32
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Self::Output {
        Timestamp(self.0 + duration)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, duration: Duration) -> Self::Output {
        Timestamp(self.0 - duration)
    }
}

/// An abstraction over time. Provides the ability to create a timestamp.
pub trait Time: Send + Sync {
    /// The current time.
    fn now(&self) -> Timestamp;
}

impl<T: Time> Time for Arc<T>
where
    T: Time,
{
    fn now(&self) -> Timestamp {
        <T as Time>::now(self)
    }
}

impl<T: Time> Time for Box<T>
where
    T: Time,
{
    fn now(&self) -> Timestamp {
        <T as Time>::now(self)
    }
}

impl<T: Time> Time for &T
where
    T: Time,
{
    fn now(&self) -> Timestamp {
        <T as Time>::now(self)
    }
}

/// An implementation of `Time` based on `tokio::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct TokioTime {
    base_instant: Instant,
    base_timestamp: Timestamp,
}

impl TokioTime {
    /// Creates a new `TokioTime`.
    pub fn new() -> Self {
        let base_instant = tokio::time::Instant::now();
        let base_timestamp = Timestamp::now();

        Self {
            base_instant,
            base_timestamp,
        }
    }
}

impl Default for TokioTime {
    fn default() -> Self {
        Self::new()
    }
}

impl Time for TokioTime {
    fn now(&self) -> Timestamp {
        let now = Instant::now();
        let elapsed = now.duration_since(self.base_instant);
        self.base_timestamp + elapsed
    }
}

/// A clock which only moves when [`ManualTime::advance`] is called.
#[derive(Debug)]
pub struct ManualTime {
    base: Timestamp,
    offset_micros: AtomicU64,
}

impl ManualTime {
    /// Creates a new clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Timestamp::now(),
            offset_micros: AtomicU64::new(0),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.offset_micros
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl Time for ManualTime {
    fn now(&self) -> Timestamp {
        self.base + Duration::from_micros(self.offset_micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_only_moves_when_advanced() {
        let time = ManualTime::new();
        let start = time.now();

        assert_eq!(time.now(), start);

        time.advance(Duration::from_millis(250));
        assert_eq!(time.now().duration_since(start), Duration::from_millis(250));
        assert_eq!(time.now().ticks_since(start), 250);
    }

    #[test]
    fn duration_since_saturates() {
        let time = ManualTime::new();
        let earlier = time.now();
        time.advance(Duration::from_secs(1));

        assert_eq!(earlier.duration_since(time.now()), Duration::ZERO);
    }
}

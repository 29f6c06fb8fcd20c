//! Abstractions over the system clock so that anything driven by timeouts can
//! be tested deterministically.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A wall-clock instant with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Time {
    /// Construct from nanoseconds since the unix epoch.
    pub fn from_timestamp_nanos(nanos: i64) -> Self {
        Self(Utc.timestamp_nanos(nanos))
    }

    /// Nanoseconds since the unix epoch.
    pub fn timestamp_nanos(&self) -> i64 {
        self.0.timestamp_nanos()
    }

    /// Returns `self - other` if `other` is not later than `self`.
    pub fn checked_duration_since(&self, other: Self) -> Option<Duration> {
        (self.0 - other.0).to_std().ok()
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + ChronoDuration::from_std(rhs).expect("duration overflow"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - ChronoDuration::from_std(rhs).expect("duration overflow"))
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// A source of [`Time`].
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that only advances when told to. For tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider pinned to `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Pin the clock to `time`.
    pub fn set(&self, time: Time) {
        *self.now.write() = time;
    }

    /// Advance the clock by `duration` and return the new instant.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(b >= a);
    }

    #[test]
    fn mock_clock_is_pinned() {
        let provider = MockProvider::new(Time::from_timestamp_nanos(100));
        assert_eq!(provider.now().timestamp_nanos(), 100);
        assert_eq!(provider.now(), provider.now());

        provider.inc(Duration::from_nanos(50));
        assert_eq!(provider.now().timestamp_nanos(), 150);

        provider.set(Time::from_timestamp_nanos(10));
        assert_eq!(provider.now().timestamp_nanos(), 10);
    }

    #[test]
    fn duration_since_saturates_direction() {
        let early = Time::from_timestamp_nanos(1_000);
        let late = Time::from_timestamp_nanos(3_500);
        assert_eq!(
            late.checked_duration_since(early),
            Some(Duration::from_nanos(2_500))
        );
        assert_eq!(early.checked_duration_since(late), None);
    }
}

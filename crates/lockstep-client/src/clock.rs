//! Clock domains.
//!
//! Two domains exist: the **local monotonic** clock (send/receive timestamps,
//! playing-start times) and the **server reference** clock (millisecond
//! integers supplied by the server).  They are never mixed in storage; the
//! [`Offset`] is the only bridge, applied at the wire boundary.
//!
//! Local time reads tokio's clock, so `tokio::time::pause` freezes it in
//! tests.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use tokio::time::Instant;

fn clock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds on the process-local monotonic clock.
///
/// Signed: a playing medium that started before this process did has a
/// negative local start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalTime(i64);

impl LocalTime {
    /// Current local monotonic time.
    pub fn now() -> Self {
        let elapsed = clock_epoch().elapsed().as_millis();
        Self(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }

    pub fn from_millis(milliseconds: i64) -> Self {
        Self(milliseconds)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Midpoint of a round trip, assuming symmetric one-way delay.
    pub fn midpoint(sent_at: Self, received_at: Self) -> Self {
        Self(sent_at.0 + (received_at.0 - sent_at.0) / 2)
    }
}

impl Add<i64> for LocalTime {
    type Output = Self;

    fn add(self, milliseconds: i64) -> Self {
        Self(self.0 + milliseconds)
    }
}

impl Sub for LocalTime {
    type Output = i64;

    fn sub(self, other: Self) -> i64 {
        self.0 - other.0
    }
}

/// `server_reference_ms − local_monotonic_ms`: add it to a local timestamp to
/// obtain a server reference timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset(i64);

impl Offset {
    /// Offset from one reference-time exchange: the server's clock reading
    /// against the local midpoint of the round trip.
    pub fn from_sample(server_reference_ms: i64, midpoint: LocalTime) -> Self {
        Self(server_reference_ms - midpoint.as_millis())
    }

    pub fn from_millis(milliseconds: i64) -> Self {
        Self(milliseconds)
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn local_to_server(self, t: LocalTime) -> i64 {
        t.as_millis() + self.0
    }

    pub fn server_to_local(self, server_reference_ms: i64) -> LocalTime {
        LocalTime::from_millis(server_reference_ms - self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_splits_the_round_trip() {
        let midpoint = LocalTime::midpoint(LocalTime::from_millis(0), LocalTime::from_millis(1000));
        assert_eq!(midpoint.as_millis(), 500);
    }

    #[test]
    fn offset_from_first_sample() {
        // Server replies 1837 for a request sent at 0 and received at 1000.
        let midpoint = LocalTime::midpoint(LocalTime::from_millis(0), LocalTime::from_millis(1000));
        let offset = Offset::from_sample(1837, midpoint);
        assert_eq!(offset.millis(), 1337);
    }

    #[test]
    fn offset_round_trips_between_domains() {
        let offset = Offset::from_millis(1337);
        let local = LocalTime::from_millis(500);
        assert_eq!(offset.local_to_server(local), 1837);
        assert_eq!(offset.server_to_local(1837), local);
    }

    #[test]
    fn server_start_before_local_epoch_yields_negative_local_time() {
        let offset = Offset::from_millis(100_000);
        let local = offset.server_to_local(40_000);
        assert_eq!(local.as_millis(), -60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn now_is_frozen_under_paused_time() {
        let a = LocalTime::now();
        let b = LocalTime::now();
        assert_eq!(a, b);
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert!(LocalTime::now() >= a);
    }
}

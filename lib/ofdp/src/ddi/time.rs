// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Moments in time.
use core::ops::Add;
use core::time::Duration;
use std::time::Instant;

/// The number of milliseconds in a second.
pub const MILLIS: u64 = 1_000;
/// The number of nanoseconds in a second.
pub const NANOS: u64 = 1_000_000_000;

/// A moment in time, taken from a monotonic clock.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Moment {
    inner: Instant,
}

impl Add<Duration> for Moment {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Moment { inner: self.inner + rhs }
    }
}

impl Moment {
    /// Compute the delta between `self - earlier` and return as
    /// milliseconds. Saturates to zero if `earlier` is in fact later.
    pub fn delta_as_millis(&self, earlier: Moment) -> u64 {
        let delta = self.delta(earlier);
        delta.as_secs() * MILLIS + u64::from(delta.subsec_millis())
    }

    /// The time elapsed from `earlier` to `self`.
    pub fn delta(&self, earlier: Moment) -> Duration {
        self.inner.saturating_duration_since(earlier.inner)
    }

    pub fn now() -> Self {
        Self { inner: Instant::now() }
    }
}

impl Default for Moment {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delta_saturates() {
        let t0 = Moment::now();
        let t1 = t0 + Duration::from_millis(1_500);
        assert_eq!(t1.delta_as_millis(t0), 1_500);
        assert_eq!(t0.delta_as_millis(t1), 0);
        assert_eq!(t1.delta(t0), Duration::from_millis(1_500));
    }
}

//! # Deferral policy for slow receivers.
//!
//! When a uid finishes a receiver later than the slow threshold it starts
//! "deferring": its receivers are split off into a side table and held back for
//! [`DeferralPolicy::initial`]. Each time one of its fragments is released the
//! hold-back decays by [`DeferralPolicy::decay_factor`], never dropping below
//! [`DeferralPolicy::floor`].
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use broadcastq::DeferralPolicy;
//!
//! let policy = DeferralPolicy {
//!     initial: Duration::from_secs(4),
//!     decay_factor: 0.5,
//!     floor: Duration::from_secs(1),
//! };
//!
//! assert_eq!(policy.next(Duration::from_secs(4)), Duration::from_secs(2));
//! assert_eq!(policy.next(Duration::from_secs(2)), Duration::from_secs(1));
//! // never below the floor
//! assert_eq!(policy.next(Duration::from_secs(1)), Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Hold-back schedule of a deferred uid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeferralPolicy {
    /// Hold-back applied when a uid starts deferring.
    pub initial: Duration,
    /// Multiplicative decay per released fragment (`< 1.0` shrinks the hold-back).
    pub decay_factor: f64,
    /// Minimum hold-back.
    pub floor: Duration,
}

impl Default for DeferralPolicy {
    /// Returns a policy with:
    /// - `initial = 5s`;
    /// - `decay_factor = 0.75`;
    /// - `floor = 0s`.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            decay_factor: 0.75,
            floor: Duration::ZERO,
        }
    }
}

impl DeferralPolicy {
    /// Computes the hold-back following `prev`.
    ///
    /// The result is `max(prev × decay_factor, floor)`. A non-finite or negative
    /// product collapses to the floor.
    pub fn next(&self, prev: Duration) -> Duration {
        let secs = prev.as_secs_f64() * self.decay_factor;
        let decayed = if secs.is_finite() && secs >= 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(self.floor)
        } else {
            self.floor
        };
        decayed.max(self.floor)
    }
}

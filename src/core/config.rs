//! # Broadcast queue constants.
//!
//! Provides [`BroadcastConstants`], the tunables of one queue instance.
//!
//! Constants are used in two ways:
//! 1. **Queue creation**: `QueueBuilder::new(name, constants, host)`
//! 2. **Live updates**: `QueueHandle::update_constants(constants)`, usually after
//!    [`BroadcastConstants::parse_overrides`] read a settings string.
//!
//! ## Sentinel values
//! - `slow_time = 0s` → slow receivers never cause deferral
//! - `hung_multiplier = 0` → hung-broadcast detection disabled
//!
//! ## Settings string
//! Overrides are a comma separated `key=value` list. Durations are milliseconds.
//! ```text
//! bcast_timeout=20000,bcast_slow_time=3000,bcast_deferral_decay_factor=0.5
//! ```
//! Unknown keys are ignored; a malformed entry rejects the whole string.

use std::time::Duration;

use crate::error::ConfigError;
use crate::policies::DeferralPolicy;

/// Tunables of a broadcast queue.
///
/// ## Field semantics
/// - `timeout`: per-receiver deadline before it is force-finished
/// - `slow_time`: finishing later than this defers the receiver's uid (`0s` = off)
/// - `allow_bg_activity_start_timeout`: background activity start window granted to receivers
/// - `hung_multiplier`: a record is hung after `hung_multiplier × timeout × receivers` (`0` = off)
/// - `deferral`, `deferral_decay_factor`, `deferral_floor`: see [`DeferralPolicy`]
/// - `history_size`, `summary_history_size`: retention of retired records
/// - `idle_poll_interval`: poll period of `wait_for_idle`/`wait_for_barrier`
/// - `bus_capacity`: event bus ring buffer size (min 1; clamped by Bus)
/// - `command_capacity`: queue actor mailbox size (min 1)
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastConstants {
    /// Time a single receiver may take before it is force-finished.
    pub timeout: Duration,

    /// Threshold above which a finishing receiver's uid starts deferring.
    ///
    /// - `Duration::ZERO` = never defer
    /// - core uids and timeout-exempt records are never deferred
    pub slow_time: Duration,

    /// How long a receiver keeps the background activity start privilege.
    pub allow_bg_activity_start_timeout: Duration,

    /// Multiplier of the whole-record hung deadline.
    pub hung_multiplier: u32,

    /// Initial hold-back of a deferred uid.
    pub deferral: Duration,

    /// Factor applied to the hold-back each time a deferred fragment is released.
    pub deferral_decay_factor: f64,

    /// Lower bound of the decayed hold-back.
    pub deferral_floor: Duration,

    /// Number of retired records kept in full.
    pub history_size: usize,

    /// Number of retired record summaries kept.
    pub summary_history_size: usize,

    /// Poll period of the idle/barrier waits.
    pub idle_poll_interval: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Capacity of the actor command channel.
    pub command_capacity: usize,
}

impl BroadcastConstants {
    /// Constants of the foreground queue (short timeout).
    pub fn foreground() -> Self {
        Self::default()
    }

    /// Constants of the background queue (long timeout).
    pub fn background() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Returns the slow-receiver threshold as an `Option`.
    ///
    /// - `None` → slow receivers are never deferred
    /// - `Some(d)` → finishing later than `d` defers the uid
    #[inline]
    pub fn slow_threshold(&self) -> Option<Duration> {
        if self.slow_time == Duration::ZERO {
            None
        } else {
            Some(self.slow_time)
        }
    }

    /// Time after the first dispatch at which a record with `receivers` receivers is hung.
    ///
    /// `None` when detection is disabled or the product overflows.
    #[inline]
    pub fn hung_after(&self, receivers: usize) -> Option<Duration> {
        if self.hung_multiplier == 0 || receivers == 0 {
            return None;
        }
        let n = u32::try_from(receivers).ok()?;
        self.timeout.checked_mul(self.hung_multiplier)?.checked_mul(n)
    }

    /// Deferral policy derived from the deferral constants.
    #[inline]
    pub fn deferral_policy(&self) -> DeferralPolicy {
        DeferralPolicy {
            initial: self.deferral,
            decay_factor: self.deferral_decay_factor,
            floor: self.deferral_floor,
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Returns a command channel capacity clamped to a minimum of 1.
    #[inline]
    pub fn command_capacity_clamped(&self) -> usize {
        self.command_capacity.max(1)
    }

    /// Applies a `key=value,key=value` settings string.
    ///
    /// Either every recognized entry is applied or, on error, nothing is.
    pub fn parse_overrides(&mut self, settings: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        for entry in settings.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| ConfigError::MalformedEntry {
                    entry: entry.to_string(),
                })?;

            match key {
                "bcast_timeout" => next.timeout = millis(key, value)?,
                "bcast_slow_time" => next.slow_time = millis(key, value)?,
                "bcast_allow_bg_activity_start_timeout" => {
                    next.allow_bg_activity_start_timeout = millis(key, value)?
                }
                "bcast_deferral" => next.deferral = millis(key, value)?,
                "bcast_deferral_decay_factor" => next.deferral_decay_factor = factor(key, value)?,
                "bcast_deferral_floor" => next.deferral_floor = millis(key, value)?,
                "bcast_hung_multiplier" => next.hung_multiplier = number(key, value)?,
                "bcast_history_size" => next.history_size = number(key, value)?,
                "bcast_summary_history_size" => next.summary_history_size = number(key, value)?,
                _ => {}
            }
        }
        *self = next;
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| invalid(key, value))
}

fn millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    number::<u64>(key, value).map(Duration::from_millis)
}

fn factor(key: &str, value: &str) -> Result<f64, ConfigError> {
    let f = number::<f64>(key, value)?;
    if f.is_finite() && f >= 0.0 {
        Ok(f)
    } else {
        Err(invalid(key, value))
    }
}

impl Default for BroadcastConstants {
    /// Default configuration (foreground queue):
    ///
    /// - `timeout = 10s`
    /// - `slow_time = 5s`
    /// - `allow_bg_activity_start_timeout = 10s`
    /// - `hung_multiplier = 2`
    /// - `deferral = 5s`, `deferral_decay_factor = 0.75`, `deferral_floor = 0s`
    /// - `history_size = 50`, `summary_history_size = 300`
    /// - `idle_poll_interval = 100ms`
    /// - `bus_capacity = 1024`, `command_capacity = 256`
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            slow_time: Duration::from_secs(5),
            allow_bg_activity_start_timeout: Duration::from_secs(10),
            hung_multiplier: 2,
            deferral: Duration::from_secs(5),
            deferral_decay_factor: 0.75,
            deferral_floor: Duration::ZERO,
            history_size: 50,
            summary_history_size: 300,
            idle_poll_interval: Duration::from_millis(100),
            bus_capacity: 1024,
            command_capacity: 256,
        }
    }
}

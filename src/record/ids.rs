//! # Identifiers and uid arithmetic.
//!
//! Records, registered receivers and split groups are addressed by small copyable
//! handles. Collections inside the queue store these handles, never the records
//! themselves.

use std::fmt;

use serde::Serialize;

/// Linux-style user id of an application or system component.
pub type Uid = u32;
/// Process id.
pub type Pid = u32;
/// Device user (profile) id.
pub type UserId = u32;

/// Range of uids reserved for a single device user.
pub const PER_USER_RANGE: u32 = 100_000;
/// First uid handed out to installed applications; everything below is a core uid.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Returns the per-user application id of `uid`.
#[inline]
pub fn app_id(uid: Uid) -> u32 {
    uid % PER_USER_RANGE
}

/// Returns the device user owning `uid`.
#[inline]
pub fn user_id_of(uid: Uid) -> UserId {
    uid / PER_USER_RANGE
}

/// Core uids (system server, shell, native daemons) are never deferred for slowness.
#[inline]
pub fn is_core_uid(uid: Uid) -> bool {
    app_id(uid) < FIRST_APPLICATION_UID
}

/// Stable handle of a record inside a queue's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(u64);

impl RecordId {
    /// Wraps a raw id.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a dynamically registered receiver (its callback handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ReceiverId(u64);

impl ReceiverId {
    /// Wraps a raw id.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "receiver:{}", self.0)
    }
}

/// Shared id of a group of split fragments that report one final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SplitToken(u32);

impl SplitToken {
    /// Token following `self`; wraps back to 1, zero is never used.
    #[inline]
    pub(crate) fn next(self) -> Self {
        match self.0.checked_add(1) {
            Some(n) => Self(n),
            None => Self(1),
        }
    }

    #[inline]
    pub(crate) const fn first() -> Self {
        Self(1)
    }

    /// Returns the raw token.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SplitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "split:{}", self.0)
    }
}

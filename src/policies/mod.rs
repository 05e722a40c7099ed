//! Scheduling policies.
//!
//! This module groups the knobs that decide **whether** a receiver gets a
//! broadcast and **how long** a slow uid is held back.
//!
//! ## Contents
//! - [`SkipPolicy`]      per-receiver delivery gate (pure predicate)
//! - [`RuleSkipPolicy`]  built-in decision table over a [`PackageState`]
//! - [`DeferralPolicy`]  decaying hold-back of deferred uids
//!
//! ## Quick wiring
//! ```text
//! BroadcastQueue::dispatch_next_receiver
//!      ├─► skip.skip_reason(record, receiver) → Skipped + stats, or deliver
//!      └─► Dispatcher uses DeferralPolicy::next(prev) on each released fragment
//! ```
//!
//! ## Defaults
//! - `RuleSkipPolicy::default()` → [`PermissivePackages`], only caller-side exclusions apply.
//! - `DeferralPolicy::default()` → initial=5s, decay=0.75, floor=0s.

mod deferral;
mod skip;

pub use deferral::DeferralPolicy;
pub use skip::{PackageState, PermissivePackages, RuleSkipPolicy, SkipPolicy, SkipReason};

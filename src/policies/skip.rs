//! # Skip policy: should this receiver get this broadcast?
//!
//! Consulted right before each delivery attempt. A skip is not an error: the
//! receiver's slot is marked `Skipped`, the skip is counted for stats and delivery
//! moves on to the next receiver.
//!
//! [`RuleSkipPolicy`] is the built-in decision table. Checks run in this order and
//! the first hit wins:
//!
//! | # | Check                                                    | Reason                               |
//! |---|----------------------------------------------------------|--------------------------------------|
//! | 1 | registered-only intent, manifest receiver                | [`SkipReason::RegisteredOnly`]       |
//! | 2 | receiver package excluded by the caller                  | [`SkipReason::ExcludedPackage`]      |
//! | 3 | manifest component disabled                              | [`SkipReason::ComponentDisabled`]    |
//! | 4 | manifest package force-stopped                           | [`SkipReason::PackageStopped`]       |
//! | 5 | receiver lacks a permission the caller requires          | [`SkipReason::MissingPermission`]    |
//! | 6 | receiver holds a permission the caller excluded          | [`SkipReason::ExcludedPermission`]   |
//! | 7 | caller lacks the permission the receiver requires        | [`SkipReason::SenderNotPermitted`]   |
//! | 8 | implicit broadcast to a background-restricted manifest   | [`SkipReason::BackgroundRestricted`] |
//!
//! Policies are pure: they read the record and the package collaborator, never
//! mutate anything.

use std::fmt;
use std::sync::Arc;

use crate::record::{BroadcastRecord, ComponentName, Receiver, Uid, UserId};

/// Why a receiver was skipped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    RegisteredOnly,
    ExcludedPackage,
    ComponentDisabled,
    PackageStopped,
    /// Receiver does not hold a permission the caller requires.
    MissingPermission(String),
    /// Receiver holds a permission the caller excluded.
    ExcludedPermission(String),
    /// Caller does not hold the receiver's permission.
    SenderNotPermitted(String),
    /// Background execution restrictions forbid waking the receiver.
    BackgroundRestricted,
}

impl SkipReason {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            SkipReason::RegisteredOnly => "skip_registered_only",
            SkipReason::ExcludedPackage => "skip_excluded_package",
            SkipReason::ComponentDisabled => "skip_component_disabled",
            SkipReason::PackageStopped => "skip_package_stopped",
            SkipReason::MissingPermission(_) => "skip_missing_permission",
            SkipReason::ExcludedPermission(_) => "skip_excluded_permission",
            SkipReason::SenderNotPermitted(_) => "skip_sender_not_permitted",
            SkipReason::BackgroundRestricted => "skip_background_restricted",
        }
    }

    /// Counted as a background execution violation in stats.
    #[inline]
    pub fn is_background_violation(&self) -> bool {
        matches!(self, SkipReason::BackgroundRestricted)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingPermission(p)
            | SkipReason::ExcludedPermission(p)
            | SkipReason::SenderNotPermitted(p) => write!(f, "{} ({p})", self.as_label()),
            _ => f.write_str(self.as_label()),
        }
    }
}

/// Delivery gate consulted before every receiver.
pub trait SkipPolicy: Send + Sync + 'static {
    /// Returns the reason to skip `receiver`, or `None` to deliver.
    fn skip_reason(&self, record: &BroadcastRecord, receiver: &Receiver) -> Option<SkipReason>;

    #[inline]
    fn should_skip(&self, record: &BroadcastRecord, receiver: &Receiver) -> bool {
        self.skip_reason(record, receiver).is_some()
    }
}

/// Package and permission state read by [`RuleSkipPolicy`].
///
/// Every method defaults to the permissive answer.
pub trait PackageState: Send + Sync + 'static {
    fn is_component_enabled(&self, _component: &ComponentName, _user: UserId) -> bool {
        true
    }

    fn is_package_stopped(&self, _package: &str, _user: UserId) -> bool {
        false
    }

    fn has_permission(&self, _permission: &str, _uid: Uid) -> bool {
        true
    }

    /// The app may not be woken by implicit broadcasts.
    fn is_background_restricted(&self, _package: &str, _uid: Uid) -> bool {
        false
    }
}

/// Package state that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePackages;

impl PackageState for PermissivePackages {}

/// Built-in decision table.
#[derive(Clone)]
pub struct RuleSkipPolicy {
    packages: Arc<dyn PackageState>,
}

impl RuleSkipPolicy {
    pub fn new(packages: Arc<dyn PackageState>) -> Self {
        Self { packages }
    }
}

impl Default for RuleSkipPolicy {
    fn default() -> Self {
        Self::new(Arc::new(PermissivePackages))
    }
}

impl SkipPolicy for RuleSkipPolicy {
    fn skip_reason(&self, record: &BroadcastRecord, receiver: &Receiver) -> Option<SkipReason> {
        let uid = receiver.uid();
        let package = receiver.package();

        if record.intent.flags.registered_only && receiver.is_manifest() {
            return Some(SkipReason::RegisteredOnly);
        }
        if record.excluded_packages.iter().any(|p| p == package) {
            return Some(SkipReason::ExcludedPackage);
        }
        if let Receiver::Manifest(m) = receiver {
            if !self.packages.is_component_enabled(&m.component, record.user_id) {
                return Some(SkipReason::ComponentDisabled);
            }
            if self.packages.is_package_stopped(package, record.user_id) {
                return Some(SkipReason::PackageStopped);
            }
        }
        if let Some(p) = record
            .required_permissions
            .iter()
            .find(|p| !self.packages.has_permission(p, uid))
        {
            return Some(SkipReason::MissingPermission(p.clone()));
        }
        if let Some(p) = record
            .excluded_permissions
            .iter()
            .find(|p| self.packages.has_permission(p, uid))
        {
            return Some(SkipReason::ExcludedPermission(p.clone()));
        }
        if let Some(p) = receiver.permission() {
            if !self.packages.has_permission(p, record.caller.uid) {
                return Some(SkipReason::SenderNotPermitted(p.to_string()));
            }
        }
        if receiver.is_manifest()
            && record.intent.is_implicit()
            && self.packages.is_background_restricted(package, uid)
        {
            return Some(SkipReason::BackgroundRestricted);
        }
        None
    }
}

//! # Intent: what is being broadcast.
//!
//! An [`Intent`] names the action and optional narrowing (package, component, data,
//! categories). Two intents are "the same broadcast" for replacement purposes when
//! [`Intent::filter_equals`] holds; extras and flags never take part in that test.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

/// Fully qualified receiver component (`package/class`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ComponentName {
    /// Owning package.
    pub package: String,
    /// Class name inside the package.
    pub class: String,
}

impl ComponentName {
    /// Creates a component name.
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Short form: `pkg/.Class` when the class lives inside the package namespace.
    pub fn short_string(&self) -> String {
        match self.class.strip_prefix(self.package.as_str()) {
            Some(rest) if rest.starts_with('.') => format!("{}/{}", self.package, rest),
            _ => format!("{}/{}", self.package, self.class),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_string())
    }
}

/// Delivery flags carried by an intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntentFlags {
    /// Replace an identical broadcast still waiting in the queue instead of adding another.
    pub replace_pending: bool,
    /// Only registered receivers may receive it; manifest receivers are skipped.
    pub registered_only: bool,
    /// Receivers may not abort the ordered chain.
    pub no_abort: bool,
    /// Sent on the foreground queue with the short timeout.
    pub foreground: bool,
}

/// Broadcast payload and addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub action: String,
    pub package: Option<String>,
    pub component: Option<ComponentName>,
    pub data: Option<String>,
    pub categories: BTreeSet<String>,
    pub flags: IntentFlags,
    pub extras: BTreeMap<String, String>,
}

impl Intent {
    /// Creates an implicit intent for `action`.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    #[inline]
    pub fn with_component(mut self, component: ComponentName) -> Self {
        self.component = Some(component);
        self
    }

    #[inline]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[inline]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    #[inline]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn with_flags(mut self, flags: IntentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// True if both intents address the same broadcast.
    ///
    /// Compares action, data, package, component and categories.
    pub fn filter_equals(&self, other: &Intent) -> bool {
        self.action == other.action
            && self.data == other.data
            && self.package == other.package
            && self.component == other.component
            && self.categories == other.categories
    }

    /// No explicit package or component.
    #[inline]
    pub fn is_implicit(&self) -> bool {
        self.package.is_none() && self.component.is_none()
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Intent {{ act={}", self.action)?;
        if let Some(pkg) = &self.package {
            write!(f, " pkg={pkg}")?;
        }
        if let Some(cmp) = &self.component {
            write!(f, " cmp={cmp}")?;
        }
        if let Some(data) = &self.data {
            write!(f, " dat={data}")?;
        }
        f.write_str(" }")
    }
}

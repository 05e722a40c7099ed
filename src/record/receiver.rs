//! # Receivers: registered callbacks and manifest components.
//!
//! A broadcast target is one of two kinds, modelled as the tagged union [`Receiver`]:
//! - [`RegisteredReceiver`]: a callback already attached to a live process.
//! - [`ManifestReceiver`]: a statically declared component whose process may need
//!   to be started before it can receive anything.

use std::fmt;

use serde::Serialize;

use super::ids::{ReceiverId, Uid};
use super::intent::ComponentName;
use crate::host::ProcessInfo;

/// Receiver registered at runtime by a live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredReceiver {
    pub id: ReceiverId,
    pub uid: Uid,
    pub package: String,
    /// Hosting process; `None` for in-system callbacks.
    pub process: Option<ProcessInfo>,
    /// Permission the sender must hold.
    pub permission: Option<String>,
}

impl RegisteredReceiver {
    pub fn new(id: ReceiverId, uid: Uid, package: impl Into<String>) -> Self {
        Self {
            id,
            uid,
            package: package.into(),
            process: None,
            permission: None,
        }
    }

    #[inline]
    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.process = Some(process);
        self
    }

    #[inline]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

/// Statically declared receiver component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestReceiver {
    pub component: ComponentName,
    /// Name of the process that hosts the component.
    pub process_name: String,
    pub uid: Uid,
    pub version: u64,
    /// Permission the sender must hold.
    pub permission: Option<String>,
}

impl ManifestReceiver {
    /// Creates a receiver hosted in the package's default process.
    pub fn new(component: ComponentName, uid: Uid) -> Self {
        let process_name = component.package.clone();
        Self {
            component,
            process_name,
            uid,
            version: 0,
            permission: None,
        }
    }

    #[inline]
    pub fn with_process_name(mut self, name: impl Into<String>) -> Self {
        self.process_name = name.into();
        self
    }

    #[inline]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[inline]
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

/// Broadcast target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Receiver {
    Registered(RegisteredReceiver),
    Manifest(ManifestReceiver),
}

impl Receiver {
    /// Uid owning the receiver.
    #[inline]
    pub fn uid(&self) -> Uid {
        match self {
            Receiver::Registered(r) => r.uid,
            Receiver::Manifest(m) => m.uid,
        }
    }

    /// Package owning the receiver.
    #[inline]
    pub fn package(&self) -> &str {
        match self {
            Receiver::Registered(r) => &r.package,
            Receiver::Manifest(m) => &m.component.package,
        }
    }

    #[inline]
    pub fn is_manifest(&self) -> bool {
        matches!(self, Receiver::Manifest(_))
    }

    #[inline]
    pub fn permission(&self) -> Option<&str> {
        match self {
            Receiver::Registered(r) => r.permission.as_deref(),
            Receiver::Manifest(m) => m.permission.as_deref(),
        }
    }
}

impl From<RegisteredReceiver> for Receiver {
    fn from(r: RegisteredReceiver) -> Self {
        Receiver::Registered(r)
    }
}

impl From<ManifestReceiver> for Receiver {
    fn from(m: ManifestReceiver) -> Self {
        Receiver::Manifest(m)
    }
}

impl fmt::Display for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Receiver::Registered(r) => write!(f, "{} {} u{}", r.id, r.package, r.uid),
            Receiver::Manifest(m) => write!(f, "{} u{}", m.component, m.uid),
        }
    }
}

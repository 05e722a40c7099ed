//! # Host collaborators.
//!
//! The queue never creates processes, talks to receivers or raises ANR dialogs
//! itself. It calls out to the collaborators bundled in [`Host`]:
//!
//! - [`ProcessManager`] looks up, starts, checks and kills hosting processes.
//! - [`ReceiverTransport`] performs the one-way delivery calls.
//! - [`AnrReporter`] is told about receivers that stopped responding.
//!
//! Every call is made from the queue actor and must not block: delivery is
//! fire-and-forget, completion comes back later as a `finish_receiver` command.
//!
//! ```text
//!  BroadcastQueue ──► ProcessManager::running_process / start_process
//!        │        ──► ReceiverTransport::schedule_receiver / perform_receive
//!        │        ──► AnrReporter::report_unresponsive
//!        ▲
//!        └── QueueHandle::process_attached / finish_receiver / background_services_finished
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::error::DeliveryError;
use crate::record::{
    BroadcastRecord, Intent, ManifestReceiver, Pid, RecordId, RegisteredReceiver, Uid, UserId,
};

/// A live (or starting) process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub uid: Uid,
}

impl ProcessInfo {
    pub fn new(pid: Pid, name: impl Into<String>, uid: Uid) -> Self {
        Self {
            pid,
            name: name.into(),
            uid,
        }
    }

    /// Same process name under the same uid (pid may differ across restarts).
    #[inline]
    pub fn same_process(&self, name: &str, uid: Uid) -> bool {
        self.uid == uid && self.name == name
    }
}

/// Payload of one delivery call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Record the delivery belongs to, when it came from a queued record.
    pub record: Option<RecordId>,
    /// Receiver index inside the record; `None` for final results.
    pub receiver_index: Option<usize>,
    pub intent: Intent,
    pub result_code: i32,
    pub result_data: Option<String>,
    pub result_extras: Option<BTreeMap<String, String>>,
    /// Ordered delivery: the result propagates to the next receiver.
    pub ordered: bool,
    pub sticky: bool,
    pub user_id: UserId,
}

/// Description of a receiver timeout handed to the ANR collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutRecord {
    pub queue: String,
    pub record: RecordId,
    pub action: String,
    /// Receiver that did not finish in time.
    pub receiver: String,
    /// Time spent in the receiver before it was abandoned.
    pub elapsed: Duration,
}

/// Process-management collaborator.
pub trait ProcessManager: Send + Sync + 'static {
    /// Returns the live process with this name and uid, if any.
    fn running_process(&self, name: &str, uid: Uid) -> Option<ProcessInfo>;

    /// Requests a process start for a manifest receiver.
    ///
    /// Returns `None` when the process cannot be started. A returned process is
    /// still starting: the queue parks the record until `process_attached`.
    fn start_process(
        &self,
        name: &str,
        receiver: &ManifestReceiver,
        record: &BroadcastRecord,
    ) -> Option<ProcessInfo>;

    /// False once the process died or is crashing.
    fn is_alive(&self, process: &ProcessInfo) -> bool;

    /// A debugger is attached; timeouts are not reported as ANRs.
    fn is_debugging(&self, _pid: Pid) -> bool {
        false
    }

    /// Kills a process that failed a delivery call.
    fn kill(&self, process: &ProcessInfo, reason: &str);

    /// Background services started by receivers of `user` are still running.
    fn has_background_services(&self, _user: UserId) -> bool {
        false
    }

    /// Allows the process to start activities from the background on behalf of `record`.
    fn grant_background_start(&self, _pid: Pid, _record: RecordId) {}

    /// Withdraws a grant made by [`ProcessManager::grant_background_start`].
    fn revoke_background_start(&self, _pid: Pid, _record: RecordId) {}
}

/// One-way delivery transport.
pub trait ReceiverTransport: Send + Sync + 'static {
    /// Delivers to a manifest receiver inside an attached process.
    fn schedule_receiver(
        &self,
        process: &ProcessInfo,
        receiver: &ManifestReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError>;

    /// Calls a registered receiver (also used for final results).
    fn perform_receive(
        &self,
        target: &RegisteredReceiver,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError>;
}

/// ANR-handling collaborator.
pub trait AnrReporter: Send + Sync + 'static {
    fn report_unresponsive(&self, process: &ProcessInfo, timeout: &TimeoutRecord);
}

/// Reporter that only logs; used when no ANR collaborator is configured.
#[derive(Debug, Default)]
pub struct LogAnrReporter;

impl AnrReporter for LogAnrReporter {
    fn report_unresponsive(&self, process: &ProcessInfo, timeout: &TimeoutRecord) {
        warn!(
            queue = %timeout.queue,
            pid = process.pid,
            process = %process.name,
            action = %timeout.action,
            receiver = %timeout.receiver,
            elapsed_ms = timeout.elapsed.as_millis() as u64,
            "broadcast receiver not responding"
        );
    }
}

/// Bundle of collaborators shared by a queue.
#[derive(Clone)]
pub struct Host {
    pub processes: Arc<dyn ProcessManager>,
    pub transport: Arc<dyn ReceiverTransport>,
    pub anr: Arc<dyn AnrReporter>,
}

impl Host {
    /// Creates a host that logs ANRs instead of reporting them.
    pub fn new(processes: Arc<dyn ProcessManager>, transport: Arc<dyn ReceiverTransport>) -> Self {
        Self {
            processes,
            transport,
            anr: Arc::new(LogAnrReporter),
        }
    }

    #[must_use]
    pub fn with_anr_reporter(mut self, anr: Arc<dyn AnrReporter>) -> Self {
        self.anr = anr;
        self
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

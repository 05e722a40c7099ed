//! # BroadcastRecord: one send request and its delivery progress.
//!
//! The sender fills in the identity (intent, caller, flags, exclusions, receivers,
//! optional result target) and hands the record to a queue. From then on only the
//! queue actor mutates it: it walks `next_receiver` forward, writes each receiver's
//! terminal [`DeliveryState`] exactly once and accumulates the ordered result.
//!
//! ## Invariants
//! - `next_receiver` never decreases.
//! - `delivery[i]` moves from `Pending` to a terminal state at most once.
//! - At most one receiver is in flight (scheduled and still `Pending`).
//! - Unordered records never set `cur_app`/`cur_filter`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::Serialize;
use tokio::time::Instant;

use super::ids::{user_id_of, Pid, ReceiverId, RecordId, SplitToken, Uid, UserId};
use super::intent::{ComponentName, Intent};
use super::receiver::{ManifestReceiver, Receiver, RegisteredReceiver};
use crate::host::{Delivery, ProcessInfo};

/// Result code reported when the ordered chain completed normally.
pub const RESULT_OK: i32 = -1;
/// Result code reported to the result target of a replaced broadcast.
pub const RESULT_CANCELED: i32 = 0;

/// Per-receiver delivery outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Skipped,
    Timeout,
}

impl DeliveryState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }

    pub fn as_label(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Skipped => "skipped",
            DeliveryState::Timeout => "timeout",
        }
    }
}

/// Where an ordered record is in its per-receiver state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    /// Nothing in flight.
    Idle,
    /// Delivered to (or waiting on the start of) a manifest receiver's process.
    AppReceive,
    /// One-way call into a registered receiver is being made.
    CallInReceive,
    /// Registered receiver was called; waiting for its finish.
    CallDoneReceive,
    /// Receiver finished but background services it started are still running.
    WaitingServices,
}

/// Accumulated ordered result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BroadcastResult {
    pub code: i32,
    pub data: Option<String>,
    pub extras: Option<BTreeMap<String, String>>,
}

/// One instant on both clock bases.
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    /// Monotonic time, used for every scheduling decision.
    pub at: Instant,
    /// Wall-clock time, used for dumps only.
    pub wall: SystemTime,
}

impl Stamp {
    #[inline]
    pub fn new(at: Instant) -> Self {
        Self {
            at,
            wall: SystemTime::now(),
        }
    }
}

/// Lifecycle timestamps of a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    pub enqueue: Option<Stamp>,
    /// First receiver started.
    pub dispatch: Option<Stamp>,
    /// Current receiver started.
    pub receiver: Option<Stamp>,
    pub finish: Option<Stamp>,
}

/// Who sent the broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallerInfo {
    pub package: String,
    pub uid: Uid,
    pub pid: Pid,
}

/// A single broadcast send request.
#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub intent: Intent,
    pub caller: CallerInfo,
    pub user_id: UserId,
    /// Receivers run one at a time and can propagate or abort the result.
    pub ordered: bool,
    pub sticky: bool,
    /// Never times out and never triggers slow-receiver deferral.
    pub timeout_exempt: bool,
    /// Deferred fragments of this broadcast are replayed before anything else.
    pub alarm: bool,
    /// Receivers are granted a background activity start window.
    pub background_start: bool,
    pub required_permissions: Vec<String>,
    pub excluded_permissions: Vec<String>,
    pub excluded_packages: Vec<String>,
    /// Receives the final result once the whole chain has run.
    pub result_to: Option<RegisteredReceiver>,

    receivers: Vec<Receiver>,

    pub(crate) id: Option<RecordId>,
    pub(crate) result: BroadcastResult,
    pub(crate) result_abort: bool,
    pub(crate) delivery: Vec<DeliveryState>,
    pub(crate) scheduled_time: Vec<Option<Instant>>,
    pub(crate) terminal_time: Vec<Option<Instant>>,
    pub(crate) state: DispatchState,
    pub(crate) next_receiver: usize,
    pub(crate) cur_receiver: Option<usize>,
    pub(crate) cur_app: Option<ProcessInfo>,
    pub(crate) cur_filter: Option<ReceiverId>,
    pub(crate) cur_component: Option<ComponentName>,
    pub(crate) timing: Timing,
    pub(crate) split_token: Option<SplitToken>,
    pub(crate) deferred: bool,
    pub(crate) manifest_count: u32,
    pub(crate) manifest_skip_count: u32,
    pub(crate) anr_count: u32,
}

impl BroadcastRecord {
    /// Creates an unordered record for `intent` with the given receivers.
    pub fn new(intent: Intent, receivers: Vec<Receiver>) -> Self {
        let n = receivers.len();
        Self {
            intent,
            caller: CallerInfo::default(),
            user_id: 0,
            ordered: false,
            sticky: false,
            timeout_exempt: false,
            alarm: false,
            background_start: false,
            required_permissions: Vec::new(),
            excluded_permissions: Vec::new(),
            excluded_packages: Vec::new(),
            result_to: None,
            receivers,
            id: None,
            result: BroadcastResult::default(),
            result_abort: false,
            delivery: vec![DeliveryState::Pending; n],
            scheduled_time: vec![None; n],
            terminal_time: vec![None; n],
            state: DispatchState::Idle,
            next_receiver: 0,
            cur_receiver: None,
            cur_app: None,
            cur_filter: None,
            cur_component: None,
            timing: Timing::default(),
            split_token: None,
            deferred: false,
            manifest_count: 0,
            manifest_skip_count: 0,
            anr_count: 0,
        }
    }

    #[inline]
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    #[inline]
    pub fn with_caller(mut self, package: impl Into<String>, uid: Uid, pid: Pid) -> Self {
        self.caller = CallerInfo {
            package: package.into(),
            uid,
            pid,
        };
        self
    }

    #[inline]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = user_id;
        self
    }

    #[inline]
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    #[inline]
    pub fn with_timeout_exempt(mut self, exempt: bool) -> Self {
        self.timeout_exempt = exempt;
        self
    }

    #[inline]
    pub fn with_alarm(mut self, alarm: bool) -> Self {
        self.alarm = alarm;
        self
    }

    #[inline]
    pub fn with_background_start(mut self, allow: bool) -> Self {
        self.background_start = allow;
        self
    }

    #[inline]
    pub fn with_required_permission(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    #[inline]
    pub fn with_excluded_permission(mut self, permission: impl Into<String>) -> Self {
        self.excluded_permissions.push(permission.into());
        self
    }

    #[inline]
    pub fn with_excluded_package(mut self, package: impl Into<String>) -> Self {
        self.excluded_packages.push(package.into());
        self
    }

    #[inline]
    pub fn with_result_to(mut self, target: RegisteredReceiver) -> Self {
        self.result_to = Some(target);
        self
    }

    /// Initial result handed to the first ordered receiver.
    #[inline]
    pub fn with_initial_result(mut self, code: i32, data: Option<String>) -> Self {
        self.result.code = code;
        self.result.data = data;
        self
    }

    /// Arena id, set once the record was accepted by a queue.
    #[inline]
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    #[inline]
    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    #[inline]
    pub fn delivery(&self) -> &[DeliveryState] {
        &self.delivery
    }

    #[inline]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    #[inline]
    pub fn next_receiver(&self) -> usize {
        self.next_receiver
    }

    #[inline]
    pub fn result(&self) -> &BroadcastResult {
        &self.result
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.result_abort
    }

    #[inline]
    pub fn split_token(&self) -> Option<SplitToken> {
        self.split_token
    }

    #[inline]
    pub fn anr_count(&self) -> u32 {
        self.anr_count
    }

    #[inline]
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Goes straight to the parallel list: unordered, registered receivers only,
    /// nobody waiting for a result.
    pub(crate) fn is_parallel(&self) -> bool {
        !self.ordered && self.result_to.is_none() && !self.receivers.iter().any(Receiver::is_manifest)
    }

    /// Implicit broadcasts that may reach manifest receivers are tracked in stats.
    pub(crate) fn counts_for_stats(&self) -> bool {
        self.intent.is_implicit() && !self.intent.flags.registered_only
    }

    #[inline]
    pub(crate) fn receiver_at(&self, index: usize) -> Option<&Receiver> {
        self.receivers.get(index)
    }

    #[inline]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.next_receiver >= self.receivers.len()
    }

    pub(crate) fn receiver_uids(&self) -> Vec<Uid> {
        self.receivers.iter().map(Receiver::uid).collect()
    }

    /// Advances the cursor and stamps the receiver start. Returns the receiver index.
    pub(crate) fn begin_receiver(&mut self, now: Instant) -> usize {
        let index = self.next_receiver;
        self.next_receiver += 1;
        if let Some(slot) = self.scheduled_time.get_mut(index) {
            *slot = Some(now);
        }
        let stamp = Stamp::new(now);
        self.timing.receiver = Some(stamp);
        if index == 0 {
            self.timing.dispatch = Some(stamp);
        }
        index
    }

    /// Writes the terminal state of receiver `index`; a no-op once written.
    pub(crate) fn set_delivery(&mut self, index: usize, state: DeliveryState, now: Instant) -> bool {
        match self.delivery.get_mut(index) {
            Some(slot) if *slot == DeliveryState::Pending && state.is_terminal() => {
                *slot = state;
                if let Some(t) = self.terminal_time.get_mut(index) {
                    *t = Some(now);
                }
                true
            }
            _ => false,
        }
    }

    /// Receivers that were started and have no terminal state yet.
    pub(crate) fn in_flight(&self) -> usize {
        self.delivery
            .iter()
            .zip(&self.scheduled_time)
            .filter(|(d, s)| **d == DeliveryState::Pending && s.is_some())
            .count()
    }

    pub(crate) fn clear_active(&mut self) {
        self.cur_receiver = None;
        self.cur_app = None;
        self.cur_filter = None;
    }

    /// Moves every receiver of `uid` at or after `from` into a new record.
    ///
    /// The remaining receivers keep their relative order. The fragment inherits the
    /// identity, the accumulated result and the result target.
    pub(crate) fn split_recipients(&mut self, uid: Uid, from: usize) -> BroadcastRecord {
        let mut moved = Vec::new();
        let mut i = from;
        while i < self.receivers.len() {
            if self.receivers[i].uid() == uid {
                moved.push(self.receivers.remove(i));
                self.delivery.remove(i);
                self.scheduled_time.remove(i);
                self.terminal_time.remove(i);
            } else {
                i += 1;
            }
        }

        let mut fragment = BroadcastRecord::new(self.intent.clone(), moved);
        fragment.caller = self.caller.clone();
        fragment.user_id = self.user_id;
        fragment.ordered = self.ordered;
        fragment.sticky = self.sticky;
        fragment.timeout_exempt = self.timeout_exempt;
        fragment.alarm = self.alarm;
        fragment.background_start = self.background_start;
        fragment.required_permissions = self.required_permissions.clone();
        fragment.excluded_permissions = self.excluded_permissions.clone();
        fragment.excluded_packages = self.excluded_packages.clone();
        fragment.result_to = self.result_to.clone();
        fragment.result = self.result.clone();
        fragment.split_token = self.split_token;
        fragment.timing.enqueue = self.timing.enqueue;
        fragment
    }

    /// Payload for receiver `index` (or for the result target when `None`).
    pub(crate) fn delivery_for(&self, index: Option<usize>, ordered: bool) -> Delivery {
        Delivery {
            record: self.id,
            receiver_index: index,
            intent: self.intent.clone(),
            result_code: self.result.code,
            result_data: self.result.data.clone(),
            result_extras: self.result.extras.clone(),
            ordered,
            sticky: self.sticky,
            user_id: self.user_id,
        }
    }

    /// Drops manifest receivers that were not started yet and belong to `package`
    /// (any package when `None`) under device user `user`. `classes` narrows the
    /// match to those component classes. Returns the uids of the dropped receivers.
    pub(crate) fn remove_package_receivers(
        &mut self,
        package: Option<&str>,
        classes: Option<&[String]>,
        user: UserId,
    ) -> Vec<Uid> {
        let mut removed = Vec::new();
        let mut i = self.receivers.len();
        while i > self.next_receiver {
            i -= 1;
            let hit = match &self.receivers[i] {
                Receiver::Manifest(m) => {
                    user_id_of(m.uid) == user
                        && package.map_or(true, |p| {
                            m.component.package == p
                                && classes.map_or(true, |c| c.contains(&m.component.class))
                        })
                }
                Receiver::Registered(_) => false,
            };
            if hit {
                removed.push(self.receivers.remove(i).uid());
                self.delivery.remove(i);
                self.scheduled_time.remove(i);
                self.terminal_time.remove(i);
            }
        }
        removed
    }

    pub(crate) fn manifest_at(&self, index: usize) -> Option<&ManifestReceiver> {
        match self.receivers.get(index) {
            Some(Receiver::Manifest(m)) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for BroadcastRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "BroadcastRecord{{{id} u{} {}}}", self.user_id, self.intent.action),
            None => write!(f, "BroadcastRecord{{u{} {}}}", self.user_id, self.intent.action),
        }
    }
}

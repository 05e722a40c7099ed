//! # BroadcastQueue: the per-queue scheduler state machine.
//!
//! Owns every record it was given (in a [`RecordArena`]) and moves them through:
//!
//! ```text
//!            enqueue
//!               │
//!     ┌─────────┴──────────┐
//!     ▼                    ▼
//!  parallel list      Dispatcher (ordered backlog + deferrals)
//!     │                    │
//!     │ drain: every       │ one receiver at a time:
//!     │ receiver at once   │   Idle ─► CallInReceive ─► CallDoneReceive ─┐
//!     │                    │   Idle ─► AppReceive (maybe pending start) ─┤
//!     │                    │                     finish / timeout / death ◄┘
//!     │                    │   (optionally WaitingServices before Idle)
//!     ▼                    ▼
//!   history ◄──── complete: final result, stats, history
//! ```
//!
//! All methods are synchronous and run on the queue actor. Internal paths never
//! recurse into `process_next`; they set the `scheduled` flag and the actor pumps
//! with [`BroadcastQueue::pump`].
//!
//! ## Delivery states
//! - unordered registered receivers become `Delivered` when the one-way call succeeds
//! - receivers awaiting a finish stay `Pending` until the ack (`Delivered`), the
//!   timeout (`Timeout`) or a skip, death or delivery failure (`Skipped`)
//!
//! ## Faults
//! A bookkeeping inconsistency ([`DispatchFault`]) is logged at `error`, published,
//! and the record is completed and dropped. The loop then goes on with the next one.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    core::{
        config::BroadcastConstants,
        dispatcher::Dispatcher,
        dump::{PendingSummary, QueueDump, RecordSummary},
        history::BroadcastHistory,
        stats::BroadcastStats,
    },
    error::{DeliveryError, DispatchFault},
    events::{Bus, Event, EventKind},
    host::{Host, ProcessInfo, TimeoutRecord},
    policies::{SkipPolicy, SkipReason},
    record::{
        is_core_uid, BroadcastRecord, DeliveryState, DispatchState, ManifestReceiver, Pid,
        Receiver, ReceiverId, RecordArena, RecordId, RegisteredReceiver, Stamp, Uid, UserId,
        RESULT_CANCELED,
    },
};

/// How a queue accepted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(RecordId),
    /// Took the place of an identical pending record, which was dropped.
    Replaced { id: RecordId, replaced: RecordId },
    /// Nothing to deliver; the record went straight to history.
    Retired(RecordId),
}

impl EnqueueOutcome {
    /// Id of the accepted record.
    #[inline]
    pub fn id(&self) -> RecordId {
        match *self {
            EnqueueOutcome::Enqueued(id)
            | EnqueueOutcome::Replaced { id, .. }
            | EnqueueOutcome::Retired(id) => id,
        }
    }
}

/// Who is acknowledging a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishTarget {
    /// The process running a manifest receiver.
    Process(Pid),
    /// A registered receiver.
    Receiver(ReceiverId),
}

/// Result a receiver hands back when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishResult {
    pub code: i32,
    pub data: Option<String>,
    pub extras: Option<BTreeMap<String, String>>,
    /// Stop the ordered chain (ignored for `no_abort` intents).
    pub abort: bool,
}

impl FinishResult {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[inline]
    pub fn with_extras(mut self, extras: BTreeMap<String, String>) -> Self {
        self.extras = Some(extras);
        self
    }

    #[inline]
    pub fn with_abort(mut self, abort: bool) -> Self {
        self.abort = abort;
        self
    }
}

/// Record parked while its receiver's process starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingStart {
    record: RecordId,
    index: usize,
}

/// Scheduled withdrawal of a background activity start grant.
#[derive(Debug, Clone, Copy)]
struct Revocation {
    at: Instant,
    pid: Pid,
    record: RecordId,
}

enum Step {
    /// The active record changed; look at the next one.
    Continue,
    /// A receiver is in flight (or nothing can run); stop.
    Done,
}

pub(crate) struct BroadcastQueue {
    name: Arc<str>,
    constants: BroadcastConstants,
    delay_behind_services: bool,
    processes_ready: bool,

    arena: RecordArena,
    parallel: VecDeque<RecordId>,
    dispatcher: Dispatcher,
    pending: Option<PendingStart>,

    scheduled: bool,
    timeout_at: Option<Instant>,
    revocations: Vec<Revocation>,

    history: BroadcastHistory,
    stats: BroadcastStats,

    host: Host,
    skip: Arc<dyn SkipPolicy>,
    bus: Bus,
}

impl BroadcastQueue {
    pub(crate) fn new(
        name: impl Into<Arc<str>>,
        constants: BroadcastConstants,
        host: Host,
        skip: Arc<dyn SkipPolicy>,
        bus: Bus,
    ) -> Self {
        Self {
            name: name.into(),
            dispatcher: Dispatcher::new(constants.deferral_policy()),
            history: BroadcastHistory::new(constants.history_size, constants.summary_history_size),
            constants,
            delay_behind_services: false,
            processes_ready: true,
            arena: RecordArena::new(),
            parallel: VecDeque::new(),
            pending: None,
            scheduled: false,
            timeout_at: None,
            revocations: Vec::new(),
            stats: BroadcastStats::new(),
            host,
            skip,
            bus,
        }
    }

    pub(crate) fn with_delay_behind_services(mut self, delay: bool) -> Self {
        self.delay_behind_services = delay;
        self
    }

    pub(crate) fn with_processes_ready(mut self, ready: bool) -> Self {
        self.processes_ready = ready;
        self
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind).with_queue(Arc::clone(&self.name))
    }

    fn record_event(&self, kind: EventKind, id: RecordId) -> Event {
        let ev = self.event(kind).with_record(id);
        match self.arena.get(id) {
            Some(r) => ev.with_action(r.intent.action.as_str()),
            None => ev,
        }
    }

    #[inline]
    fn schedule_broadcasts(&mut self) {
        self.scheduled = true;
    }

    /// Runs `process_next` until no more work was scheduled.
    pub(crate) fn pump(&mut self) {
        while self.scheduled {
            self.process_next(true);
        }
    }

    // ---- Enqueue ----

    pub(crate) fn enqueue(&mut self, mut record: BroadcastRecord) -> EnqueueOutcome {
        let now = Instant::now();
        record.timing.enqueue = Some(Stamp::new(now));
        let parallel = record.is_parallel();
        let replace = record.intent.flags.replace_pending;
        let nothing_to_do = record.receivers().is_empty() && record.result_to.is_none();
        let id = self.arena.insert(record);

        if nothing_to_do {
            debug!(queue = %self.name, record = %id, "no receivers; retiring immediately");
            self.add_to_history(id, now);
            return EnqueueOutcome::Retired(id);
        }
        if replace {
            if let Some(replaced) = self.replace_pending(id, parallel) {
                return EnqueueOutcome::Replaced { id, replaced };
            }
        }

        if parallel {
            self.parallel.push_back(id);
        } else {
            if let Some(r) = self.arena.get(id) {
                if r.alarm {
                    self.dispatcher.begin_alarm(&r.receiver_uids());
                }
            }
            self.dispatcher.enqueue_ordered(id);
        }
        debug!(queue = %self.name, record = %id, parallel, "enqueued broadcast");
        self.bus.publish(
            self.record_event(EventKind::Enqueued, id)
                .with_reason(if parallel { "parallel" } else { "ordered" }),
        );
        self.schedule_broadcasts();
        EnqueueOutcome::Enqueued(id)
    }

    /// Swaps `new` into the slot of the newest queued record with an equal intent.
    ///
    /// The active record, parked fragments and anything that was ever deferred
    /// (fragments flushed back by `cancel_deferrals` included) are never replaced.
    fn replace_pending(&mut self, new: RecordId, parallel: bool) -> Option<RecordId> {
        let (intent, user_id) = {
            let r = self.arena.get(new)?;
            (r.intent.clone(), r.user_id)
        };
        let candidates: Vec<RecordId> = if parallel {
            self.parallel.iter().rev().copied().collect()
        } else {
            self.dispatcher.queued_newest_first()
        };
        let old = candidates.into_iter().find(|c| {
            self.arena.get(*c).map_or(false, |o| {
                o.user_id == user_id
                    && !o.deferred
                    && o.split_token.is_none()
                    && o.intent.filter_equals(&intent)
            })
        })?;

        let swapped = if parallel {
            match self.parallel.iter_mut().find(|r| **r == old) {
                Some(slot) => {
                    *slot = new;
                    true
                }
                None => false,
            }
        } else {
            self.dispatcher.replace(old, new)
        };
        if !swapped {
            return None;
        }
        let old_record = self.arena.remove(old)?;

        if let Some(r) = self.arena.get(new) {
            if !parallel && r.alarm {
                self.dispatcher.begin_alarm(&r.receiver_uids());
            }
        }
        if !parallel && old_record.alarm {
            self.dispatcher.end_alarm(&old_record.receiver_uids());
        }

        if let Some(target) = &old_record.result_to {
            let mut delivery = old_record.delivery_for(None, false);
            delivery.result_code = RESULT_CANCELED;
            delivery.result_data = None;
            delivery.result_extras = None;
            if let Err(e) = self.host.transport.perform_receive(target, &delivery) {
                warn!(
                    queue = %self.name,
                    record = %old,
                    error = %e,
                    "failed to cancel replaced broadcast"
                );
            }
        }

        info!(
            queue = %self.name,
            record = %new,
            replaced = %old,
            action = %intent.action,
            "replaced pending broadcast"
        );
        self.bus.publish(
            self.record_event(EventKind::Replaced, new)
                .with_reason(old.to_string()),
        );
        Some(old)
    }

    // ---- Dispatch loop ----

    /// Delivers parallel records, then advances the ordered record as far as it can.
    pub(crate) fn process_next(&mut self, from_msg: bool) {
        if from_msg {
            self.scheduled = false;
        }
        let now = Instant::now();

        self.drain_parallel(now);

        if !self.check_pending_start(now) {
            return;
        }

        while let Some(id) = self.dispatcher.get_next(now) {
            match self.step(id, now) {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => return,
                Err(fault) => self.contain_fault(id, fault, now),
            }
        }
    }

    fn drain_parallel(&mut self, now: Instant) {
        while let Some(id) = self.parallel.pop_front() {
            let count = match self.arena.get_mut(id) {
                Some(r) => {
                    r.timing.dispatch = Some(Stamp::new(now));
                    r.receivers().len()
                }
                None => {
                    self.report_fault(id, &DispatchFault::MissingRecord(id));
                    continue;
                }
            };
            debug!(queue = %self.name, record = %id, receivers = count, "delivering parallel broadcast");

            for _ in 0..count {
                let Some(r) = self.arena.get_mut(id) else {
                    break;
                };
                let index = r.begin_receiver(now);
                let receiver = r.receiver_at(index).cloned();
                match receiver {
                    Some(Receiver::Registered(target)) => {
                        self.deliver_registered(id, index, &target, false, now)
                    }
                    _ => {
                        self.report_fault(id, &DispatchFault::ManifestInParallel(id));
                        if let Some(r) = self.arena.get_mut(id) {
                            r.set_delivery(index, DeliveryState::Skipped, now);
                        }
                    }
                }
            }
            self.add_to_history(id, now);
        }
    }

    /// Returns `false` while a live process is still starting for the active record.
    fn check_pending_start(&mut self, now: Instant) -> bool {
        let Some(p) = self.pending else {
            return true;
        };
        let app = self.arena.get(p.record).and_then(|r| r.cur_app.clone());
        if let Some(app) = &app {
            if self.host.processes.is_alive(app) {
                return false;
            }
        }

        warn!(
            queue = %self.name,
            record = %p.record,
            receiver = p.index,
            "pending process died before attaching; skipping receiver"
        );
        self.pending = None;
        self.discard_receiver(
            p.record,
            p.index,
            app.map(|a| a.pid),
            "process died before attaching",
            now,
        );
        true
    }

    fn step(&mut self, id: RecordId, now: Instant) -> Result<Step, DispatchFault> {
        let (receivers, exempt, dispatch_at) = {
            let r = self.arena.get(id).ok_or(DispatchFault::MissingRecord(id))?;
            (r.receivers().len(), r.timeout_exempt, r.timing.dispatch.map(|s| s.at))
        };

        let mut force = false;
        if let (Some(at), Some(limit)) = (dispatch_at, self.constants.hung_after(receivers)) {
            let hung = at.checked_add(limit).map_or(false, |deadline| now > deadline);
            if self.processes_ready && !exempt && hung {
                let elapsed = now.saturating_duration_since(at);
                warn!(
                    queue = %self.name,
                    record = %id,
                    receivers,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "hung broadcast; forcing finish"
                );
                self.bus.publish(
                    self.record_event(EventKind::HungDiscarded, id)
                        .with_elapsed(elapsed),
                );
                self.broadcast_timeout(false, now);
                force = true;
                if let Some(r) = self.arena.get_mut(id) {
                    r.state = DispatchState::Idle;
                }
            }
        }

        let r = self.arena.get(id).ok_or(DispatchFault::MissingRecord(id))?;
        if r.state != DispatchState::Idle {
            return Ok(Step::Done);
        }
        if force || r.result_abort || r.is_exhausted() {
            self.complete_record(id, now);
            return Ok(Step::Continue);
        }

        if !r.deferred {
            let index = r.next_receiver;
            let uid = r
                .receiver_at(index)
                .map(Receiver::uid)
                .ok_or(DispatchFault::CursorOutOfRange { record: id, index })?;
            if self.dispatcher.is_deferring(uid, now) {
                self.defer_receivers(id, uid, now)?;
                return Ok(Step::Continue);
            }
        }

        self.dispatch_next_receiver(id, now)?;
        Ok(Step::Done)
    }

    /// Moves the next receivers of a deferring uid into the deferral table.
    ///
    /// If only one receiver is left the whole record moves; otherwise the uid's
    /// receivers are split into a fragment.
    fn defer_receivers(&mut self, id: RecordId, uid: Uid, now: Instant) -> Result<(), DispatchFault> {
        let r = self.arena.get_mut(id).ok_or(DispatchFault::MissingRecord(id))?;
        let from = r.next_receiver;

        let deferred_id = if from + 1 >= r.receivers().len() {
            self.dispatcher.retire(id);
            id
        } else {
            let mut fragment = r.split_recipients(uid, from);
            if r.result_to.is_some() {
                let token = self.dispatcher.track_split(r.split_token);
                r.split_token = Some(token);
                fragment.split_token = Some(token);
            }
            let moved = fragment.receivers().len();
            let fragment_id = self.arena.insert(fragment);
            debug!(
                queue = %self.name,
                record = %id,
                fragment = %fragment_id,
                uid,
                moved,
                "split broadcast for deferred uid"
            );
            self.bus.publish(
                self.record_event(EventKind::BroadcastSplit, id)
                    .with_uid(uid)
                    .with_reason(fragment_id.to_string()),
            );
            fragment_id
        };

        if let Some(d) = self.arena.get_mut(deferred_id) {
            d.deferred = true;
        }
        self.dispatcher.add_deferred(uid, deferred_id, now);
        self.bus.publish(
            self.record_event(EventKind::FragmentDeferred, deferred_id)
                .with_uid(uid),
        );
        Ok(())
    }

    fn dispatch_next_receiver(&mut self, id: RecordId, now: Instant) -> Result<(), DispatchFault> {
        let (index, receiver) = {
            let r = self.arena.get_mut(id).ok_or(DispatchFault::MissingRecord(id))?;
            let index = r.begin_receiver(now);
            let receiver = r
                .receiver_at(index)
                .cloned()
                .ok_or(DispatchFault::CursorOutOfRange { record: id, index })?;
            (index, receiver)
        };

        if index == 0 {
            debug!(queue = %self.name, record = %id, "dispatch started");
            self.bus.publish(self.record_event(EventKind::DispatchStarted, id));
        }
        if self.timeout_at.is_none() {
            self.timeout_at = Some(now + self.constants.timeout);
        }

        match receiver {
            Receiver::Registered(target) => self.dispatch_registered(id, index, &target, now),
            Receiver::Manifest(m) => self.dispatch_manifest(id, index, m, now),
        }
        Ok(())
    }

    fn dispatch_registered(
        &mut self,
        id: RecordId,
        index: usize,
        target: &RegisteredReceiver,
        now: Instant,
    ) {
        let ordered = self.arena.get(id).map_or(false, |r| r.ordered);
        self.deliver_registered(id, index, target, ordered, now);

        let Some(r) = self.arena.get_mut(id) else {
            return;
        };
        if !ordered || r.cur_filter.is_none() {
            r.state = DispatchState::Idle;
            self.schedule_broadcasts();
        } else if r.background_start {
            if let Some(app) = &target.process {
                self.host.processes.grant_background_start(app.pid, id);
            }
        }
    }

    /// One-way call into a registered receiver; unordered calls do not wait.
    fn deliver_registered(
        &mut self,
        id: RecordId,
        index: usize,
        target: &RegisteredReceiver,
        ordered: bool,
        now: Instant,
    ) {
        let receiver = Receiver::Registered(target.clone());
        let Some(r) = self.arena.get_mut(id) else {
            return;
        };
        if let Some(reason) = self.skip.skip_reason(r, &receiver) {
            r.set_delivery(index, DeliveryState::Skipped, now);
            self.on_skipped(id, index, &receiver, reason);
            return;
        }

        if ordered {
            r.cur_receiver = Some(index);
            r.cur_filter = Some(target.id);
            r.cur_app = target.process.clone();
            r.state = DispatchState::CallInReceive;
        }
        let delivery = r.delivery_for(Some(index), ordered);

        match self.host.transport.perform_receive(target, &delivery) {
            Ok(()) => {
                if ordered {
                    r.state = DispatchState::CallDoneReceive;
                } else {
                    r.set_delivery(index, DeliveryState::Delivered, now);
                }
                self.bus.publish(
                    self.record_event(EventKind::ReceiverDelivered, id)
                        .with_receiver(index)
                        .with_uid(target.uid),
                );
            }
            Err(e) => {
                r.set_delivery(index, DeliveryState::Skipped, now);
                if ordered {
                    r.clear_active();
                }
                warn!(
                    queue = %self.name,
                    record = %id,
                    receiver = %target.id,
                    error = %e,
                    "failure sending broadcast"
                );
                if let Some(app) = &target.process {
                    self.host.processes.kill(app, "can't deliver broadcast");
                }
                self.publish_delivery_failed(id, index, target.process.as_ref(), &e);
            }
        }
    }

    fn dispatch_manifest(&mut self, id: RecordId, index: usize, m: ManifestReceiver, now: Instant) {
        let receiver = Receiver::Manifest(m.clone());
        let Some(r) = self.arena.get_mut(id) else {
            return;
        };
        if let Some(reason) = self.skip.skip_reason(r, &receiver) {
            r.set_delivery(index, DeliveryState::Skipped, now);
            r.manifest_skip_count += 1;
            r.cur_receiver = None;
            r.state = DispatchState::Idle;
            self.on_skipped(id, index, &receiver, reason);
            self.schedule_broadcasts();
            return;
        }

        r.manifest_count += 1;
        r.state = DispatchState::AppReceive;
        r.cur_receiver = Some(index);
        r.cur_component = Some(m.component.clone());
        let background_start = r.background_start;

        if let Some(app) = self.host.processes.running_process(&m.process_name, m.uid) {
            match self.process_cur_broadcast(id, &app) {
                Ok(()) => {
                    if background_start {
                        self.host.processes.grant_background_start(app.pid, id);
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        record = %id,
                        component = %m.component.short_string(),
                        error = %e,
                        "exception when sending broadcast; restarting process"
                    );
                    self.host.processes.kill(&app, "can't deliver broadcast");
                    self.publish_delivery_failed(id, index, Some(&app), &e);
                }
            }
        }

        let started = match self.arena.get(id) {
            Some(r) => self.host.processes.start_process(&m.process_name, &m, r),
            None => return,
        };
        match started {
            None => {
                warn!(
                    queue = %self.name,
                    record = %id,
                    process = %m.process_name,
                    uid = m.uid,
                    "unable to launch app for broadcast; discarding receiver"
                );
                self.discard_receiver(id, index, None, "process start failed", now);
            }
            Some(process) => {
                debug!(
                    queue = %self.name,
                    record = %id,
                    pid = process.pid,
                    process = %process.name,
                    "waiting for process to attach"
                );
                if let Some(r) = self.arena.get_mut(id) {
                    r.cur_app = Some(process.clone());
                }
                if background_start {
                    self.host.processes.grant_background_start(process.pid, id);
                }
                self.pending = Some(PendingStart { record: id, index });
                self.bus.publish(
                    self.record_event(EventKind::ProcessStartRequested, id)
                        .with_receiver(index)
                        .with_uid(m.uid)
                        .with_pid(process.pid),
                );
            }
        }
    }

    /// Hands the in-flight manifest receiver to an attached process.
    fn process_cur_broadcast(&mut self, id: RecordId, app: &ProcessInfo) -> Result<(), DeliveryError> {
        let Some(r) = self.arena.get_mut(id) else {
            return Err(DeliveryError::Remote {
                reason: format!("record {id} is no longer queued"),
            });
        };
        let index = r.cur_receiver;
        let Some(m) = index.and_then(|i| r.manifest_at(i)).cloned() else {
            return Err(DeliveryError::Remote {
                reason: format!("record {id} has no manifest receiver in flight"),
            });
        };
        r.cur_app = Some(app.clone());
        let delivery = r.delivery_for(index, r.ordered);

        if let Err(e) = self.host.transport.schedule_receiver(app, &m, &delivery) {
            r.cur_app = None;
            return Err(e);
        }

        let mut ev = self
            .record_event(EventKind::ReceiverDelivered, id)
            .with_uid(m.uid)
            .with_pid(app.pid);
        if let Some(i) = index {
            ev = ev.with_receiver(i);
        }
        self.bus.publish(ev);
        Ok(())
    }

    fn on_skipped(&mut self, id: RecordId, index: usize, receiver: &Receiver, reason: SkipReason) {
        debug!(
            queue = %self.name,
            record = %id,
            receiver = %receiver,
            reason = %reason,
            "receiver skipped"
        );
        if reason.is_background_violation() {
            if let Some(r) = self.arena.get(id) {
                self.stats
                    .add_background_violation(&r.intent.action, receiver.package());
            }
        }
        self.bus.publish(
            self.record_event(EventKind::ReceiverSkipped, id)
                .with_receiver(index)
                .with_uid(receiver.uid())
                .with_reason(reason.to_string()),
        );
    }

    fn publish_delivery_failed(
        &self,
        id: RecordId,
        index: usize,
        app: Option<&ProcessInfo>,
        e: &DeliveryError,
    ) {
        let mut ev = self
            .record_event(EventKind::DeliveryFailed, id)
            .with_receiver(index)
            .with_reason(e.to_string());
        if let Some(app) = app {
            ev = ev.with_pid(app.pid);
        }
        self.bus.publish(ev);
    }

    /// Gives up on receiver `index` without delivering and moves on.
    fn discard_receiver(
        &mut self,
        id: RecordId,
        index: usize,
        pid: Option<Pid>,
        reason: &str,
        now: Instant,
    ) {
        if let Some(r) = self.arena.get_mut(id) {
            r.set_delivery(index, DeliveryState::Skipped, now);
        }
        let mut ev = self
            .record_event(EventKind::ReceiverDiscarded, id)
            .with_receiver(index)
            .with_reason(reason);
        if let Some(pid) = pid {
            ev = ev.with_pid(pid);
        }
        self.bus.publish(ev);
        self.finish_inner(id, None, false, now);
        self.schedule_broadcasts();
    }

    // ---- Receiver completion ----

    /// Applies a finish acknowledgement. Returns `false` if it matched no active receiver.
    pub(crate) fn finish_receiver(
        &mut self,
        target: FinishTarget,
        result: FinishResult,
        wait_for_services: bool,
    ) -> bool {
        let now = Instant::now();
        let Some(id) = self.match_finish(target) else {
            debug!(queue = %self.name, ?target, "finish for no active receiver ignored");
            return false;
        };

        let (index, elapsed) = match self.arena.get(id) {
            Some(r) => (
                r.cur_receiver,
                r.timing
                    .receiver
                    .map_or(Duration::ZERO, |s| now.saturating_duration_since(s.at)),
            ),
            None => return false,
        };
        let mut ev = self
            .record_event(EventKind::ReceiverFinished, id)
            .with_elapsed(elapsed);
        if let Some(i) = index {
            ev = ev.with_receiver(i);
        }
        self.bus.publish(ev);

        if self.finish_inner(id, Some(result), wait_for_services, now) {
            self.process_next(false);
        }
        true
    }

    fn match_finish(&self, target: FinishTarget) -> Option<RecordId> {
        let id = self.dispatcher.current()?;
        if self.pending.map_or(false, |p| p.record == id) {
            return None;
        }
        let r = self.arena.get(id)?;
        let hit = match target {
            FinishTarget::Process(pid) => {
                r.cur_component.is_some() && r.cur_app.as_ref().map_or(false, |a| a.pid == pid)
            }
            FinishTarget::Receiver(rid) => r.cur_filter == Some(rid),
        };
        hit.then_some(id)
    }

    /// Ends the in-flight receiver of `id`.
    ///
    /// Returns `true` when the caller should run the next receiver right away.
    fn finish_inner(
        &mut self,
        id: RecordId,
        result: Option<FinishResult>,
        wait_for_services: bool,
        now: Instant,
    ) -> bool {
        if self.pending.map_or(false, |p| p.record == id) {
            self.pending = None;
        }
        let is_active = self.dispatcher.current() == Some(id);
        let Some(r) = self.arena.get_mut(id) else {
            return false;
        };

        let state = r.state;
        if state == DispatchState::Idle {
            warn!(queue = %self.name, record = %id, "finish_receiver called but state is idle");
        }
        let elapsed = r
            .timing
            .receiver
            .map_or(Duration::ZERO, |s| now.saturating_duration_since(s.at));
        let cur_index = r.cur_receiver;
        let app = r.cur_app.clone();
        if let Some(i) = cur_index {
            if state != DispatchState::Idle {
                r.set_delivery(i, DeliveryState::Delivered, now);
            }
        }
        r.clear_active();
        r.state = DispatchState::Idle;

        if let Some(res) = result {
            r.result.code = res.code;
            r.result.data = res.data;
            r.result.extras = res.extras;
            r.result_abort = res.abort && !r.intent.flags.no_abort;
        }

        let exempt = r.timeout_exempt;
        let background_start = r.background_start;
        let user_id = r.user_id;
        let component = r.cur_component.take();
        let cur_manifest = cur_index.and_then(|i| r.manifest_at(i)).cloned();
        let next_manifest = r.manifest_at(r.next_receiver).cloned();

        if let Some(app) = &app {
            if background_start {
                self.schedule_revocation(id, app, elapsed, now);
            }
            if !exempt && !is_core_uid(app.uid) {
                let slow = self.constants.slow_threshold().map_or(false, |t| elapsed > t);
                if slow && !self.dispatcher.is_deferring(app.uid, now) {
                    self.dispatcher.start_deferring(app.uid, now);
                    info!(
                        queue = %self.name,
                        uid = app.uid,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow receiver; deferring uid"
                    );
                    self.bus.publish(
                        self.event(EventKind::UidDeferred)
                            .with_uid(app.uid)
                            .with_elapsed(elapsed),
                    );
                }
            }
        }

        if wait_for_services && component.is_some() && self.delay_behind_services && is_active {
            let same_process = match (&cur_manifest, &next_manifest) {
                (Some(c), Some(n)) => c.uid == n.uid && c.process_name == n.process_name,
                _ => false,
            };
            if !same_process && self.host.processes.has_background_services(user_id) {
                info!(queue = %self.name, record = %id, "delaying finish for background services");
                if let Some(r) = self.arena.get_mut(id) {
                    r.state = DispatchState::WaitingServices;
                    r.cur_component = component;
                }
                self.bus.publish(self.record_event(EventKind::WaitingServices, id));
                return false;
            }
        }

        matches!(state, DispatchState::AppReceive | DispatchState::CallDoneReceive)
    }

    fn schedule_revocation(&mut self, id: RecordId, app: &ProcessInfo, elapsed: Duration, now: Instant) {
        let window = self.constants.allow_bg_activity_start_timeout;
        match window.checked_sub(elapsed) {
            Some(left) if !left.is_zero() => self.revocations.push(Revocation {
                at: now + left,
                pid: app.pid,
                record: id,
            }),
            _ => self.host.processes.revoke_background_start(app.pid, id),
        }
    }

    fn revoke_due(&mut self, now: Instant) {
        let processes = &self.host.processes;
        self.revocations.retain(|rv| {
            if rv.at <= now {
                processes.revoke_background_start(rv.pid, rv.record);
                false
            } else {
                true
            }
        });
    }

    /// Sends the final result, records stats and history.
    fn complete_record(&mut self, id: RecordId, now: Instant) {
        self.timeout_at = None;
        self.dispatcher.retire(id);
        let Some(r) = self.arena.get_mut(id) else {
            return;
        };
        r.timing.finish = Some(Stamp::new(now));

        let send = match (&r.result_to, r.split_token) {
            (None, _) => false,
            (Some(_), Some(token)) => self.dispatcher.release_split(token),
            (Some(_), None) => true,
        };
        let target = if send { r.result_to.take() } else { None };
        let delivery = r.delivery_for(None, false);
        let alarm_uids = if r.alarm { r.receiver_uids() } else { Vec::new() };
        let dispatch_time = r
            .timing
            .dispatch
            .map_or(Duration::ZERO, |d| now.saturating_duration_since(d.at));
        let stats = r.counts_for_stats().then(|| {
            (
                r.intent.action.clone(),
                r.caller.package.clone(),
                r.manifest_count,
                r.manifest_skip_count,
            )
        });

        if let Some(target) = target {
            match self.host.transport.perform_receive(&target, &delivery) {
                Ok(()) => self
                    .bus
                    .publish(self.record_event(EventKind::ResultDelivered, id)),
                Err(e) => warn!(
                    queue = %self.name,
                    record = %id,
                    error = %e,
                    "failure sending broadcast result"
                ),
            }
        }
        self.dispatcher.end_alarm(&alarm_uids);
        if let Some((action, package, receives, skips)) = stats {
            self.stats
                .add_broadcast(&action, &package, receives, skips, dispatch_time);
        }
        self.add_to_history(id, now);
    }

    /// Moves a record out of the arena into history. A no-op for unknown ids.
    fn add_to_history(&mut self, id: RecordId, now: Instant) {
        let Some(mut r) = self.arena.remove(id) else {
            return;
        };
        if r.timing.finish.is_none() {
            r.timing.finish = Some(Stamp::new(now));
        }
        let elapsed = match (r.timing.dispatch, r.timing.finish) {
            (Some(d), Some(f)) => f.at.saturating_duration_since(d.at),
            _ => Duration::ZERO,
        };
        self.history.add(&r);
        self.bus.publish(
            self.event(EventKind::Retired)
                .with_record(id)
                .with_action(r.intent.action.as_str())
                .with_elapsed(elapsed),
        );
    }

    fn report_fault(&self, id: RecordId, fault: &DispatchFault) {
        error!(
            queue = %self.name,
            record = %id,
            fault = %fault,
            label = fault.as_label(),
            "dispatch fault; discarding"
        );
        self.bus.publish(
            self.event(EventKind::DispatchFault)
                .with_record(id)
                .with_reason(fault.to_string()),
        );
    }

    fn contain_fault(&mut self, id: RecordId, fault: DispatchFault, now: Instant) {
        self.report_fault(id, &fault);
        if self.pending.map_or(false, |p| p.record == id) {
            self.pending = None;
        }
        if let Some(r) = self.arena.get_mut(id) {
            r.clear_active();
            r.state = DispatchState::Idle;
        }
        if self.arena.contains(id) {
            self.complete_record(id, now);
        }
        self.dispatcher.remove(id);
    }

    // ---- Timeouts ----

    /// Per-receiver timeout of the active record.
    ///
    /// `from_msg` is set when the armed deadline fired; such a call re-arms instead
    /// of acting when the current receiver started later than the deadline assumed.
    pub(crate) fn broadcast_timeout(&mut self, from_msg: bool, now: Instant) {
        if from_msg {
            self.timeout_at = None;
        }
        let Some(id) = self.dispatcher.current() else {
            return;
        };
        let timeout = self.constants.timeout;
        let processes_ready = self.processes_ready;
        let Some(r) = self.arena.get_mut(id) else {
            return;
        };
        let receiver_start = r.timing.receiver.map_or(now, |s| s.at);

        if from_msg {
            if !processes_ready || r.timeout_exempt {
                return;
            }
            if let Some(deadline) = receiver_start.checked_add(timeout) {
                if deadline > now {
                    self.timeout_at = Some(deadline);
                    return;
                }
            }
        }

        if r.state == DispatchState::WaitingServices {
            info!(queue = %self.name, record = %id, "waited long enough for background services");
            r.cur_component = None;
            r.state = DispatchState::Idle;
            self.schedule_broadcasts();
            return;
        }

        let app = r.cur_app.clone();
        let debugging = app
            .as_ref()
            .map_or(false, |a| self.host.processes.is_debugging(a.pid));
        let elapsed = now.saturating_duration_since(receiver_start);
        r.timing.receiver = Some(Stamp::new(now));
        if !debugging {
            r.anr_count += 1;
        }
        let index = r.cur_receiver.or_else(|| r.next_receiver.checked_sub(1));
        let receiver = index
            .and_then(|i| r.receiver_at(i))
            .map(ToString::to_string)
            .unwrap_or_default();
        if let Some(i) = index {
            r.set_delivery(i, DeliveryState::Timeout, now);
        }
        let action = r.intent.action.clone();

        warn!(
            queue = %self.name,
            record = %id,
            receiver = %receiver,
            elapsed_ms = elapsed.as_millis() as u64,
            debugging,
            "receiver timed out"
        );
        let mut ev = self
            .record_event(EventKind::ReceiverTimeout, id)
            .with_elapsed(elapsed);
        if let Some(i) = index {
            ev = ev.with_receiver(i);
        }
        self.bus.publish(ev);

        self.finish_inner(id, None, false, now);
        self.schedule_broadcasts();

        if debugging {
            return;
        }
        if let Some(app) = app {
            let report = TimeoutRecord {
                queue: self.name.to_string(),
                record: id,
                action,
                receiver,
                elapsed,
            };
            self.host.anr.report_unresponsive(&app, &report);
            self.bus.publish(
                self.record_event(EventKind::AnrReported, id)
                    .with_pid(app.pid),
            );
        }
    }

    /// Fires whatever deadline passed: receiver timeout, grant revocations, deferrals.
    pub(crate) fn on_timer(&mut self, now: Instant) {
        if self.timeout_at.map_or(false, |t| t <= now) {
            self.broadcast_timeout(true, now);
        }
        self.revoke_due(now);
        if self.dispatcher.check_deferrals(now) {
            self.schedule_broadcasts();
        }
    }

    /// Earliest instant `on_timer` has something to do.
    pub(crate) fn next_deadline(&self, now: Instant) -> Option<Instant> {
        [
            self.timeout_at,
            self.revocations.iter().map(|r| r.at).min(),
            self.dispatcher.next_deferral_deadline(now),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ---- Process lifecycle ----

    /// The process the pending record waits for attached. Returns `true` if the
    /// receiver was handed over.
    pub(crate) fn on_process_attached(&mut self, app: &ProcessInfo) -> bool {
        let now = Instant::now();
        let Some(p) = self.pending else {
            return false;
        };
        let Some(expected) = self.arena.get(p.record).and_then(|r| r.cur_app.clone()) else {
            self.pending = None;
            return false;
        };
        if expected.pid != app.pid {
            return false;
        }
        if !app.same_process(&expected.name, expected.uid) {
            error!(
                queue = %self.name,
                pid = app.pid,
                expected = %expected.name,
                attached = %app.name,
                "attached process does not match pending broadcast"
            );
            return false;
        }

        self.pending = None;
        match self.process_cur_broadcast(p.record, app) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    queue = %self.name,
                    record = %p.record,
                    pid = app.pid,
                    error = %e,
                    "exception in new application when starting receiver"
                );
                self.host.processes.kill(app, "can't deliver broadcast");
                self.publish_delivery_failed(p.record, p.index, Some(app), &e);
                self.discard_receiver(p.record, p.index, Some(app.pid), "delivery failed", now);
                false
            }
        }
    }

    /// A process died: the receiver it was running (or starting for) is skipped.
    pub(crate) fn process_gone(&mut self, pid: Pid) -> bool {
        let now = Instant::now();
        let Some(id) = self.dispatcher.current() else {
            return false;
        };
        let index = match self.arena.get(id) {
            Some(r) if r.cur_app.as_ref().map_or(false, |a| a.pid == pid) => r.cur_receiver,
            _ => return false,
        };

        warn!(queue = %self.name, record = %id, pid, "receiver process died");
        match index {
            Some(i) => self.discard_receiver(id, i, Some(pid), "process died", now),
            None => {
                self.finish_inner(id, None, false, now);
                self.schedule_broadcasts();
            }
        }
        true
    }

    /// Drops queued manifest receivers of a disabled or removed package from every
    /// record this queue holds, deferred fragments included.
    ///
    /// `package: None` clears every package of device `user`; `classes` restricts
    /// the match to those components. Receivers already started are left alone.
    pub(crate) fn cleanup_disabled_package_receivers(
        &mut self,
        package: Option<&str>,
        classes: Option<&[String]>,
        user: UserId,
    ) -> bool {
        let ids: Vec<RecordId> = self
            .parallel
            .iter()
            .copied()
            .chain(self.dispatcher.all_records())
            .collect();

        let mut did_something = false;
        for id in ids {
            let ordered = !self.parallel.contains(&id);
            let Some(r) = self.arena.get_mut(id) else {
                continue;
            };
            let removed = r.remove_package_receivers(package, classes, user);
            if removed.is_empty() {
                continue;
            }
            did_something = true;
            if ordered && r.alarm {
                self.dispatcher.end_alarm(&removed);
            }
            debug!(
                queue = %self.name,
                record = %id,
                removed = removed.len(),
                user,
                "removed receivers of disabled package"
            );
            self.bus.publish(
                self.record_event(EventKind::PackageReceiversRemoved, id)
                    .with_reason(package.unwrap_or("*")),
            );
        }
        if did_something {
            self.schedule_broadcasts();
        }
        did_something
    }

    pub(crate) fn background_services_finished(&mut self, user: UserId) {
        let Some(id) = self.dispatcher.current() else {
            return;
        };
        if let Some(r) = self.arena.get_mut(id) {
            if r.user_id == user && r.state == DispatchState::WaitingServices {
                info!(queue = %self.name, record = %id, user, "background services finished; resuming");
                r.cur_component = None;
                r.state = DispatchState::Idle;
                self.process_next(false);
            }
        }
    }

    pub(crate) fn set_processes_ready(&mut self) {
        self.processes_ready = true;
        self.schedule_broadcasts();
    }

    // ---- Deferral / config ----

    /// Flushes every deferred fragment back into the ordered backlog.
    pub(crate) fn cancel_deferrals(&mut self) -> usize {
        let moved = self.dispatcher.cancel_deferrals();
        if moved > 0 {
            info!(queue = %self.name, moved, "cancelled broadcast deferrals");
            self.bus.publish(
                self.event(EventKind::DeferralsCancelled)
                    .with_reason(moved.to_string()),
            );
            self.schedule_broadcasts();
        }
        moved
    }

    pub(crate) fn update_constants(&mut self, constants: BroadcastConstants) {
        self.dispatcher.set_policy(constants.deferral_policy());
        self.history
            .resize(constants.history_size, constants.summary_history_size);
        info!(
            queue = %self.name,
            timeout_ms = constants.timeout.as_millis() as u64,
            slow_ms = constants.slow_time.as_millis() as u64,
            "broadcast constants updated"
        );
        self.constants = constants;
    }

    // ---- Queries ----

    pub(crate) fn is_idle(&self) -> bool {
        self.parallel.is_empty() && self.pending.is_none() && self.dispatcher.is_idle()
    }

    /// True once every record enqueued at or before `barrier` left the queue.
    pub(crate) fn is_beyond_barrier(&self, barrier: Instant) -> bool {
        if self.is_idle() {
            return true;
        }
        let before = |id: &RecordId| {
            self.arena
                .get(*id)
                .and_then(|r| r.timing.enqueue)
                .map_or(false, |s| s.at <= barrier)
        };
        !self.parallel.iter().any(before) && !self.dispatcher.all_records().iter().any(before)
    }

    /// One-line state description for wait loops.
    pub(crate) fn describe_state(&self) -> String {
        let mut out = format!(
            "{}: parallel={} ordered={}",
            self.name,
            self.parallel.len(),
            self.dispatcher.backlog().count()
        );
        match self.dispatcher.current().and_then(|id| self.arena.get(id)) {
            Some(r) => {
                let _ = write!(
                    out,
                    " active={r} state={:?} receiver={}/{}",
                    r.state,
                    r.next_receiver,
                    r.receivers().len()
                );
            }
            None => out.push_str(" active=none"),
        }
        if let Some(p) = self.pending {
            let _ = write!(out, " pending={}", p.record);
        }
        out
    }

    pub(crate) fn dump(&self) -> QueueDump {
        let now = Instant::now();
        let summary = |id: &RecordId| self.arena.get(*id).map(RecordSummary::from_record);
        QueueDump {
            queue: self.name.to_string(),
            processes_ready: self.processes_ready,
            parallel: self.parallel.iter().filter_map(summary).collect(),
            active: self.dispatcher.current().as_ref().and_then(summary),
            ordered: self.dispatcher.backlog().filter_map(|id| summary(&id)).collect(),
            pending: self.pending.map(|p| PendingSummary {
                record: p.record,
                receiver_index: p.index,
                process: self.arena.get(p.record).and_then(|r| r.cur_app.clone()),
            }),
            deferrals: self.dispatcher.deferral_snapshots(now),
            history: self.history.entries().cloned().collect(),
            summaries: self.history.summaries().cloned().collect(),
            total_retired: self.history.total_retired(),
            stats: self.stats.rows(),
            stats_since_ms: self.stats.since_ms(),
        }
    }

    pub(crate) fn take_stats(&mut self) -> BroadcastStats {
        self.stats.take()
    }

    /// Records currently owned (queued, active, deferred).
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    #[cfg(test)]
    pub(crate) fn record(&self, id: RecordId) -> Option<&BroadcastRecord> {
        self.arena.get(id)
    }

    #[cfg(test)]
    pub(crate) fn active(&self) -> Option<RecordId> {
        self.dispatcher.current()
    }

    #[cfg(test)]
    pub(crate) fn pending_record(&self) -> Option<RecordId> {
        self.pending.map(|p| p.record)
    }

    #[cfg(test)]
    pub(crate) fn timeout_at(&self) -> Option<Instant> {
        self.timeout_at
    }

    #[cfg(test)]
    pub(crate) fn is_deferring(&mut self, uid: Uid) -> bool {
        self.dispatcher.is_deferring(uid, Instant::now())
    }

    #[cfg(test)]
    pub(crate) fn start_deferring(&mut self, uid: Uid) {
        self.dispatcher.start_deferring(uid, Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn split_refcount(&self, token: crate::record::SplitToken) -> Option<u32> {
        self.dispatcher.split_refcount(token)
    }

    #[cfg(test)]
    pub(crate) fn stats(&self) -> &BroadcastStats {
        &self.stats
    }
}

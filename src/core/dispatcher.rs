//! # Dispatcher: ordered backlog and per-uid deferral.
//!
//! The dispatcher decides which ordered record runs next. It owns no records, only
//! [`RecordId`]s; the queue's arena owns the data.
//!
//! ## Selection order (`get_next`)
//! ```text
//! 1. the active record, while it is still running
//! 2. alarm deferrals            (replayed before anything else)
//! 3. normal deferrals           (only once `defer_until` passed, unless the backlog is empty)
//! 4. head of the ordered backlog
//! ```
//!
//! ## Deferral
//! A uid that finished a receiver too slowly starts deferring. Its future receivers
//! are split off into fragments parked under the uid. Each released fragment pushes
//! the uid's next release further out by the decayed [`DeferralPolicy`] hold-back.
//! An entry with no fragments left expires once its window passed.
//!
//! ## Split refcounts
//! Splitting a record that has a result target allocates a [`SplitToken`] shared by
//! both halves with refcount 2; every further split of the group adds one. The
//! result fires when the last fragment completes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::policies::DeferralPolicy;
use crate::record::{RecordId, SplitToken, Uid};

/// Fragments held back for one uid.
#[derive(Debug)]
struct Deferrals {
    uid: Uid,
    deferred_by: Duration,
    defer_until: Instant,
    records: VecDeque<RecordId>,
}

/// Dump view of a deferral entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferralSnapshot {
    pub uid: Uid,
    pub alarm: bool,
    pub deferred_by_ms: u64,
    /// Time left until the next fragment may be released.
    pub remaining_ms: u64,
    pub records: Vec<RecordId>,
}

pub(crate) struct Dispatcher {
    ordered: VecDeque<RecordId>,
    current: Option<RecordId>,
    /// Sorted by `defer_until`.
    deferred: Vec<Deferrals>,
    alarm_deferrals: Vec<Deferrals>,
    /// Receiver uids of in-flight alarm broadcasts.
    alarm_uids: HashMap<Uid, u32>,
    policy: DeferralPolicy,
    next_token: SplitToken,
    split_refcounts: HashMap<SplitToken, u32>,
}

impl Dispatcher {
    pub(crate) fn new(policy: DeferralPolicy) -> Self {
        Self {
            ordered: VecDeque::new(),
            current: None,
            deferred: Vec::new(),
            alarm_deferrals: Vec::new(),
            alarm_uids: HashMap::new(),
            policy,
            next_token: SplitToken::first(),
            split_refcounts: HashMap::new(),
        }
    }

    pub(crate) fn set_policy(&mut self, policy: DeferralPolicy) {
        self.policy = policy;
    }

    pub(crate) fn enqueue_ordered(&mut self, id: RecordId) {
        self.ordered.push_back(id);
    }

    #[inline]
    pub(crate) fn current(&self) -> Option<RecordId> {
        self.current
    }

    /// Returns the record whose turn it is and makes it the active one.
    pub(crate) fn get_next(&mut self, now: Instant) -> Option<RecordId> {
        if self.current.is_some() {
            return self.current;
        }
        let some_queued = !self.ordered.is_empty();

        let mut next = pop_first(&mut self.alarm_deferrals);
        if next.is_none() {
            next = self.release_deferred(now, some_queued);
        }
        if next.is_none() {
            next = self.ordered.pop_front();
        }
        self.current = next;
        next
    }

    fn release_deferred(&mut self, now: Instant, some_queued: bool) -> Option<RecordId> {
        let mut found = None;
        for (i, d) in self.deferred.iter().enumerate() {
            if now < d.defer_until && some_queued {
                // sorted: nothing later is ready either
                break;
            }
            if !d.records.is_empty() {
                found = Some(i);
                break;
            }
        }

        let mut d = self.deferred.remove(found?);
        let id = d.records.pop_front();
        d.deferred_by = self.policy.next(d.deferred_by);
        d.defer_until += d.deferred_by;
        insert_sorted(&mut self.deferred, d);
        id
    }

    /// Drops `id` as the active record (completed, or moved to the deferral table).
    pub(crate) fn retire(&mut self, id: RecordId) {
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Forgets `id` wherever it is.
    pub(crate) fn remove(&mut self, id: RecordId) {
        self.retire(id);
        self.ordered.retain(|r| *r != id);
        for d in self.deferred.iter_mut().chain(self.alarm_deferrals.iter_mut()) {
            d.records.retain(|r| *r != id);
        }
    }

    pub(crate) fn begin_alarm(&mut self, uids: &[Uid]) {
        for uid in uids {
            *self.alarm_uids.entry(*uid).or_insert(0) += 1;
        }
    }

    pub(crate) fn end_alarm(&mut self, uids: &[Uid]) {
        for uid in uids {
            if let Some(n) = self.alarm_uids.get_mut(uid) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.alarm_uids.remove(uid);
                }
            }
        }
    }

    /// Marks `uid` as slow. Returns `true` if it was not deferring before.
    pub(crate) fn start_deferring(&mut self, uid: Uid, now: Instant) -> bool {
        let initial = self.policy.initial;
        if let Some(pos) = self.deferred.iter().position(|d| d.uid == uid) {
            let mut d = self.deferred.remove(pos);
            d.deferred_by = initial;
            d.defer_until = d.defer_until.max(now + initial);
            insert_sorted(&mut self.deferred, d);
            return false;
        }
        if let Some(d) = self.alarm_deferrals.iter_mut().find(|d| d.uid == uid) {
            d.deferred_by = initial;
            return false;
        }

        let d = Deferrals {
            uid,
            deferred_by: initial,
            defer_until: now + initial,
            records: VecDeque::new(),
        };
        if self.alarm_uids.contains_key(&uid) {
            self.alarm_deferrals.push(d);
        } else {
            insert_sorted(&mut self.deferred, d);
        }
        true
    }

    /// True while `uid` is deferring. An empty entry whose window passed expires here.
    pub(crate) fn is_deferring(&mut self, uid: Uid, now: Instant) -> bool {
        for list in [&mut self.deferred, &mut self.alarm_deferrals] {
            if let Some(pos) = list.iter().position(|d| d.uid == uid) {
                let d = &list[pos];
                if d.records.is_empty() && now >= d.defer_until {
                    list.remove(pos);
                    return false;
                }
                return true;
            }
        }
        false
    }

    /// Parks `id` under `uid`, creating the entry if the uid was not deferring yet.
    pub(crate) fn add_deferred(&mut self, uid: Uid, id: RecordId, now: Instant) {
        let entry = self
            .deferred
            .iter_mut()
            .chain(self.alarm_deferrals.iter_mut())
            .find(|d| d.uid == uid);
        match entry {
            Some(d) => d.records.push_back(id),
            None => {
                self.start_deferring(uid, now);
                self.add_deferred_existing(uid, id);
            }
        }
    }

    fn add_deferred_existing(&mut self, uid: Uid, id: RecordId) {
        if let Some(d) = self
            .deferred
            .iter_mut()
            .chain(self.alarm_deferrals.iter_mut())
            .find(|d| d.uid == uid)
        {
            d.records.push_back(id);
        }
    }

    /// Periodic deferral check: expires empty entries and reports whether a parked
    /// fragment became releasable.
    pub(crate) fn check_deferrals(&mut self, now: Instant) -> bool {
        self.deferred
            .retain(|d| !(d.records.is_empty() && now >= d.defer_until));
        self.alarm_deferrals.retain(|d| !d.records.is_empty());
        self.alarm_deferrals.iter().any(|d| !d.records.is_empty())
            || self
                .deferred
                .iter()
                .any(|d| !d.records.is_empty() && now >= d.defer_until)
    }

    /// Next instant at which a held-back fragment becomes releasable.
    pub(crate) fn next_deferral_deadline(&self, now: Instant) -> Option<Instant> {
        self.deferred
            .iter()
            .filter(|d| !d.records.is_empty() && d.defer_until > now)
            .map(|d| d.defer_until)
            .min()
    }

    /// Flushes every parked fragment to the front of the backlog and clears all
    /// uid deferrals. Returns the number of fragments moved.
    pub(crate) fn cancel_deferrals(&mut self) -> usize {
        let mut moved: Vec<RecordId> = Vec::new();
        for d in self.alarm_deferrals.drain(..).chain(self.deferred.drain(..)) {
            moved.extend(d.records);
        }
        for id in moved.iter().rev() {
            self.ordered.push_front(*id);
        }
        moved.len()
    }

    /// Joins a record to a split group; allocates a token on its first split.
    pub(crate) fn track_split(&mut self, existing: Option<SplitToken>) -> SplitToken {
        match existing {
            Some(token) => {
                *self.split_refcounts.entry(token).or_insert(1) += 1;
                token
            }
            None => {
                let token = self.next_token;
                self.next_token = token.next();
                self.split_refcounts.insert(token, 2);
                token
            }
        }
    }

    /// One fragment of the group completed. Returns `true` if it was the last one.
    pub(crate) fn release_split(&mut self, token: SplitToken) -> bool {
        match self.split_refcounts.get_mut(&token) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                self.split_refcounts.remove(&token);
                true
            }
            None => true,
        }
    }

    #[cfg(test)]
    pub(crate) fn split_refcount(&self, token: SplitToken) -> Option<u32> {
        self.split_refcounts.get(&token).copied()
    }

    /// Backlog records, newest first. Parked fragments are not included.
    pub(crate) fn queued_newest_first(&self) -> Vec<RecordId> {
        self.ordered.iter().rev().copied().collect()
    }

    /// Puts `new` in the backlog slot of `old`.
    pub(crate) fn replace(&mut self, old: RecordId, new: RecordId) -> bool {
        match self.ordered.iter_mut().find(|r| **r == old) {
            Some(slot) => {
                *slot = new;
                true
            }
            None => false,
        }
    }

    /// Active record, then backlog, then parked fragments.
    pub(crate) fn all_records(&self) -> Vec<RecordId> {
        let mut out: Vec<RecordId> = self.current.into_iter().collect();
        out.extend(self.ordered.iter().copied());
        for d in self.alarm_deferrals.iter().chain(self.deferred.iter()) {
            out.extend(d.records.iter().copied());
        }
        out
    }

    #[inline]
    pub(crate) fn backlog(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.ordered.iter().copied()
    }

    /// Nothing active, queued or parked.
    pub(crate) fn is_idle(&self) -> bool {
        self.current.is_none()
            && self.ordered.is_empty()
            && self.deferred.iter().all(|d| d.records.is_empty())
            && self.alarm_deferrals.iter().all(|d| d.records.is_empty())
    }

    pub(crate) fn deferral_snapshots(&self, now: Instant) -> Vec<DeferralSnapshot> {
        let snap = |d: &Deferrals, alarm: bool| DeferralSnapshot {
            uid: d.uid,
            alarm,
            deferred_by_ms: d.deferred_by.as_millis() as u64,
            remaining_ms: d.defer_until.saturating_duration_since(now).as_millis() as u64,
            records: d.records.iter().copied().collect(),
        };
        self.alarm_deferrals
            .iter()
            .map(|d| snap(d, true))
            .chain(self.deferred.iter().map(|d| snap(d, false)))
            .collect()
    }
}

fn pop_first(list: &mut [Deferrals]) -> Option<RecordId> {
    list.iter_mut().find_map(|d| d.records.pop_front())
}

fn insert_sorted(list: &mut Vec<Deferrals>, d: Deferrals) {
    let pos = list
        .iter()
        .position(|x| x.defer_until > d.defer_until)
        .unwrap_or(list.len());
    list.insert(pos, d);
}

//! # Retired-record history.
//!
//! Every record leaving a queue is snapshotted into a bounded ring of full
//! [`HistoryEntry`] values plus a longer ring of compact [`HistorySummary`] values.
//! Both drop their oldest element when full.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::record::{BroadcastRecord, DeliveryState, RecordId, SplitToken, Stamp, Uid, UserId};

/// Snapshot of a retired record.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: Option<RecordId>,
    pub action: String,
    pub caller_package: String,
    pub caller_uid: Uid,
    pub user_id: UserId,
    pub ordered: bool,
    pub receivers: Vec<String>,
    pub delivery: Vec<DeliveryState>,
    /// Time each receiver took to reach its terminal state.
    pub receiver_ms: Vec<Option<u64>>,
    pub result_code: i32,
    pub aborted: bool,
    pub anr_count: u32,
    pub manifest_count: u32,
    pub manifest_skip_count: u32,
    pub split_token: Option<SplitToken>,
    pub enqueue_wall_ms: Option<u64>,
    pub dispatch_wall_ms: Option<u64>,
    pub finish_wall_ms: Option<u64>,
}

impl HistoryEntry {
    pub(crate) fn from_record(r: &BroadcastRecord) -> Self {
        let receiver_ms = r
            .scheduled_time
            .iter()
            .zip(&r.terminal_time)
            .map(|(s, t)| match (s, t) {
                (Some(s), Some(t)) => Some(t.saturating_duration_since(*s).as_millis() as u64),
                _ => None,
            })
            .collect();

        Self {
            id: r.id,
            action: r.intent.action.clone(),
            caller_package: r.caller.package.clone(),
            caller_uid: r.caller.uid,
            user_id: r.user_id,
            ordered: r.ordered,
            receivers: r.receivers().iter().map(ToString::to_string).collect(),
            delivery: r.delivery.clone(),
            receiver_ms,
            result_code: r.result.code,
            aborted: r.result_abort,
            anr_count: r.anr_count,
            manifest_count: r.manifest_count,
            manifest_skip_count: r.manifest_skip_count,
            split_token: r.split_token,
            enqueue_wall_ms: wall_ms(r.timing.enqueue),
            dispatch_wall_ms: wall_ms(r.timing.dispatch),
            finish_wall_ms: wall_ms(r.timing.finish),
        }
    }
}

/// Compact form kept for a longer horizon.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySummary {
    pub action: String,
    pub enqueue_wall_ms: Option<u64>,
    pub dispatch_wall_ms: Option<u64>,
    pub finish_wall_ms: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct BroadcastHistory {
    entries: VecDeque<HistoryEntry>,
    summaries: VecDeque<HistorySummary>,
    capacity: usize,
    summary_capacity: usize,
    total: u64,
}

impl BroadcastHistory {
    pub(crate) fn new(capacity: usize, summary_capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            summaries: VecDeque::with_capacity(summary_capacity.min(1024)),
            capacity,
            summary_capacity,
            total: 0,
        }
    }

    pub(crate) fn add(&mut self, r: &BroadcastRecord) {
        let entry = HistoryEntry::from_record(r);
        let summary = HistorySummary {
            action: entry.action.clone(),
            enqueue_wall_ms: entry.enqueue_wall_ms,
            dispatch_wall_ms: entry.dispatch_wall_ms,
            finish_wall_ms: entry.finish_wall_ms,
        };
        push_bounded(&mut self.entries, entry, self.capacity);
        push_bounded(&mut self.summaries, summary, self.summary_capacity);
        self.total += 1;
    }

    pub(crate) fn resize(&mut self, capacity: usize, summary_capacity: usize) {
        self.capacity = capacity;
        self.summary_capacity = summary_capacity;
        trim(&mut self.entries, capacity);
        trim(&mut self.summaries, summary_capacity);
    }

    /// Oldest first.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub(crate) fn summaries(&self) -> impl Iterator<Item = &HistorySummary> {
        self.summaries.iter()
    }

    /// Records retired since the queue started, including evicted ones.
    pub(crate) fn total_retired(&self) -> u64 {
        self.total
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    trim(ring, capacity - 1);
    ring.push_back(item);
}

fn trim<T>(ring: &mut VecDeque<T>, capacity: usize) {
    while ring.len() > capacity {
        ring.pop_front();
    }
}

pub(crate) fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn wall_ms(stamp: Option<Stamp>) -> Option<u64> {
    stamp.map(|s| epoch_ms(s.wall))
}

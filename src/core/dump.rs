//! # Serializable queue snapshot.
//!
//! [`QueueDump`] captures the lists, the active and pending record, the deferral
//! table, history and statistics of one queue. It is plain data: render it with
//! [`QueueDump::to_json`] or walk the fields.

use serde::Serialize;

use super::dispatcher::DeferralSnapshot;
use super::history::{HistoryEntry, HistorySummary};
use super::stats::StatsRow;
use crate::host::ProcessInfo;
use crate::record::{BroadcastRecord, DispatchState, RecordId, SplitToken};

/// Compact view of a queued record.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: Option<RecordId>,
    pub action: String,
    pub ordered: bool,
    pub state: DispatchState,
    pub next_receiver: usize,
    pub receivers: usize,
    pub deferred: bool,
    pub split_token: Option<SplitToken>,
}

impl RecordSummary {
    pub(crate) fn from_record(r: &BroadcastRecord) -> Self {
        Self {
            id: r.id,
            action: r.intent.action.clone(),
            ordered: r.ordered,
            state: r.state,
            next_receiver: r.next_receiver,
            receivers: r.receivers().len(),
            deferred: r.deferred,
            split_token: r.split_token,
        }
    }
}

/// Record parked until its receiver's process attaches.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub record: RecordId,
    pub receiver_index: usize,
    pub process: Option<ProcessInfo>,
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDump {
    pub queue: String,
    pub processes_ready: bool,
    pub parallel: Vec<RecordSummary>,
    pub active: Option<RecordSummary>,
    pub ordered: Vec<RecordSummary>,
    pub pending: Option<PendingSummary>,
    pub deferrals: Vec<DeferralSnapshot>,
    pub history: Vec<HistoryEntry>,
    pub summaries: Vec<HistorySummary>,
    pub total_retired: u64,
    pub stats: Vec<StatsRow>,
    pub stats_since_ms: u64,
}

impl QueueDump {
    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

//! Queue core: scheduling state machine and its actor.
//!
//! The public surface of this module is [`QueueBuilder`] (spawns a queue),
//! [`QueueHandle`] (talks to it), [`BroadcastConstants`] and the value types
//! returned by queries.
//!
//! Internal modules:
//! - [`queue`]: the per-queue state machine (parallel drain, ordered dispatch, timeouts);
//! - [`dispatcher`]: ordered backlog, per-uid deferral and split refcounts;
//! - [`actor`]: owns one queue and applies commands in order;
//! - [`history`] / [`stats`]: retired records and per-action counters;
//! - [`dump`]: serializable snapshot of a queue.

mod actor;
mod builder;
mod config;
mod dispatcher;
mod dump;
mod handle;
mod history;
mod queue;
mod stats;

#[cfg(test)]
mod tests;

pub use builder::QueueBuilder;
pub use config::BroadcastConstants;
pub use dispatcher::DeferralSnapshot;
pub use dump::{PendingSummary, QueueDump, RecordSummary};
pub use handle::QueueHandle;
pub use history::{HistoryEntry, HistorySummary};
pub use queue::{EnqueueOutcome, FinishResult, FinishTarget};
pub use stats::{ActionStats, BroadcastStats, StatsRow};

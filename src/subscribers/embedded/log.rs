//! # LogWriter: events to `tracing`
//!
//! A minimal subscriber that turns queue events into structured `tracing` records.
//! Problems (timeouts, ANRs, faults, failed deliveries) log at `warn`/`error`,
//! the normal flow at `debug`.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! DEBUG broadcastq: enqueued queue=foreground record=#3 action=com.example.SYNC mode=ordered
//!  WARN broadcastq: receiver timeout queue=foreground record=#3 index=1 elapsed_ms=10000
//!  WARN broadcastq: anr reported queue=foreground record=#3 pid=4711
//! DEBUG broadcastq: retired queue=foreground record=#3 elapsed_ms=10042
//! ```

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event writer subscriber.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let queue = e.queue.as_deref().unwrap_or("-");
        let record = e.record.map(|r| r.get());
        let action = e.action.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("-");

        match e.kind {
            EventKind::Enqueued => {
                debug!(target: "broadcastq", queue, ?record, action, mode = reason, "enqueued")
            }
            EventKind::Replaced => {
                debug!(target: "broadcastq", queue, ?record, action, replaced = reason, "replaced pending")
            }
            EventKind::DispatchStarted => {
                debug!(target: "broadcastq", queue, ?record, action, "dispatch started")
            }
            EventKind::ReceiverDelivered => {
                debug!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, uid = ?e.uid, "delivered")
            }
            EventKind::ReceiverFinished => {
                debug!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, elapsed_ms = ?e.elapsed_ms, "finished")
            }
            EventKind::ReceiverSkipped => {
                debug!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, uid = ?e.uid, reason, "skipped")
            }
            EventKind::ProcessStartRequested => {
                debug!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, pid = ?e.pid, "waiting for process start")
            }
            EventKind::ResultDelivered => {
                debug!(target: "broadcastq", queue, ?record, action, "result delivered")
            }
            EventKind::Retired => {
                debug!(target: "broadcastq", queue, ?record, action, elapsed_ms = ?e.elapsed_ms, "retired")
            }
            EventKind::WaitingServices => {
                info!(target: "broadcastq", queue, ?record, action, "delay finish behind services")
            }
            EventKind::UidDeferred => {
                info!(target: "broadcastq", queue, uid = ?e.uid, elapsed_ms = ?e.elapsed_ms, "uid deferring")
            }
            EventKind::BroadcastSplit => {
                info!(target: "broadcastq", queue, ?record, uid = ?e.uid, fragment = reason, "split")
            }
            EventKind::FragmentDeferred => {
                info!(target: "broadcastq", queue, ?record, uid = ?e.uid, "deferred")
            }
            EventKind::DeferralsCancelled => {
                info!(target: "broadcastq", queue, "deferrals cancelled")
            }
            EventKind::ReceiverDiscarded => {
                warn!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, pid = ?e.pid, reason, "receiver discarded")
            }
            EventKind::PackageReceiversRemoved => {
                info!(target: "broadcastq", queue, ?record, action, package = reason, "package receivers removed")
            }
            EventKind::ReceiverTimeout => {
                warn!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, elapsed_ms = ?e.elapsed_ms, "receiver timeout")
            }
            EventKind::AnrReported => {
                warn!(target: "broadcastq", queue, ?record, pid = ?e.pid, "anr reported")
            }
            EventKind::DeliveryFailed => {
                warn!(target: "broadcastq", queue, ?record, index = ?e.receiver_index, pid = ?e.pid, reason, "delivery failed")
            }
            EventKind::HungDiscarded => {
                warn!(target: "broadcastq", queue, ?record, action, elapsed_ms = ?e.elapsed_ms, "hung broadcast discarded")
            }
            EventKind::DispatchFault => {
                error!(target: "broadcastq", queue, ?record, reason, "dispatch fault")
            }
            EventKind::SubscriberOverflow => {
                warn!(target: "broadcastq", subscriber = ?e.subscriber, reason, "subscriber overflow")
            }
            EventKind::SubscriberPanicked => {
                error!(target: "broadcastq", subscriber = ?e.subscriber, reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}

//! # Runtime events emitted by broadcast queues.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Record events**: a record entering, being replaced in or leaving a queue
//! - **Receiver events**: per-receiver delivery flow (delivered, skipped, timeout, ...)
//! - **Deferral events**: slow uids and split fragments
//! - **Subscriber events**: problems in the subscriber workers themselves
//!
//! The [`Event`] struct carries additional metadata such as timestamps, queue name,
//! record id, receiver index and reasons.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//! Use `seq` to restore the exact order when events are delivered out of order.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use broadcastq::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::ReceiverTimeout)
//!     .with_queue("foreground")
//!     .with_action("android.intent.action.TIME_TICK")
//!     .with_receiver(2)
//!     .with_elapsed(Duration::from_secs(10));
//!
//! assert_eq!(ev.kind, EventKind::ReceiverTimeout);
//! assert_eq!(ev.queue.as_deref(), Some("foreground"));
//! assert_eq!(ev.elapsed_ms, Some(10_000));
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::record::{Pid, RecordId, Uid};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `subscriber`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Record events ===
    /// Record accepted by the queue.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    /// - `reason`: "parallel" or "ordered"
    Enqueued,

    /// Record replaced an identical pending one; the old one got a canceled result.
    ///
    /// Sets:
    /// - `queue`, `record` (new), `action`
    /// - `reason`: id of the replaced record
    Replaced,

    /// First receiver of a record started.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    DispatchStarted,

    /// Final result handed to the record's result target.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    ResultDelivered,

    /// Record completed and moved to history.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    /// - `elapsed_ms`: time from first dispatch to finish
    Retired,

    /// Record exceeded its whole-record deadline and was force-finished.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    /// - `elapsed_ms`: time since first dispatch
    HungDiscarded,

    /// Logical fault inside the dispatch loop; the record was discarded.
    ///
    /// Sets:
    /// - `queue`, `record`
    /// - `reason`: fault description
    DispatchFault,

    // === Receiver events ===
    /// Delivery call to the receiver was made.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`, `uid`
    ReceiverDelivered,

    /// Receiver acknowledged completion.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`
    /// - `elapsed_ms`: time spent in the receiver
    ReceiverFinished,

    /// Skip policy rejected the receiver.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`, `uid`
    /// - `reason`: skip reason label
    ReceiverSkipped,

    /// Receiver unavailable (process could not start or died); delivery moved on.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`
    /// - `pid`: process, when known
    /// - `reason`: why
    ReceiverDiscarded,

    /// Queued manifest receivers of a disabled or removed package were dropped.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    /// - `reason`: package name, or `*` for a whole-user cleanup
    PackageReceiversRemoved,

    /// Hosting process start requested; the record is parked until it attaches.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`, `uid`, `pid`
    ProcessStartRequested,

    /// Receiver did not finish within the per-receiver timeout.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`
    /// - `elapsed_ms`: time spent in the receiver
    ReceiverTimeout,

    /// Unresponsive process reported to the ANR collaborator.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `pid`
    AnrReported,

    /// One-way call failed; the process was killed.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `receiver_index`, `pid`
    /// - `reason`: transport error
    DeliveryFailed,

    /// Receiver finished but background services are still running.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`
    WaitingServices,

    // === Deferral events ===
    /// A uid was slow and now defers.
    ///
    /// Sets:
    /// - `queue`, `uid`
    /// - `elapsed_ms`: time the slow receiver took
    UidDeferred,

    /// A record was split to pull out a deferring uid's receivers.
    ///
    /// Sets:
    /// - `queue`, `record` (original), `action`, `uid`
    /// - `reason`: id of the new fragment
    BroadcastSplit,

    /// A record (or fragment) was parked in the deferral table.
    ///
    /// Sets:
    /// - `queue`, `record`, `action`, `uid`
    FragmentDeferred,

    /// All deferrals were flushed back into the ordered backlog.
    ///
    /// Sets:
    /// - `queue`
    DeferralsCancelled,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Name of the emitting queue.
    pub queue: Option<Arc<str>>,
    /// Record the event is about.
    pub record: Option<RecordId>,
    /// Broadcast action.
    pub action: Option<Arc<str>>,
    /// Receiver index inside the record.
    pub receiver_index: Option<u32>,
    pub uid: Option<Uid>,
    pub pid: Option<Pid>,
    /// Elapsed time in milliseconds (compact).
    pub elapsed_ms: Option<u32>,
    /// Human-readable reason (skip reason, errors, overflow details, etc.).
    pub reason: Option<Arc<str>>,
    /// Subscriber name for subscriber events.
    pub subscriber: Option<&'static str>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            queue: None,
            record: None,
            action: None,
            receiver_index: None,
            uid: None,
            pid: None,
            elapsed_ms: None,
            reason: None,
            subscriber: None,
        }
    }

    #[inline]
    pub fn with_queue(mut self, queue: impl Into<Arc<str>>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[inline]
    pub fn with_record(mut self, id: RecordId) -> Self {
        self.record = Some(id);
        self
    }

    #[inline]
    pub fn with_action(mut self, action: impl Into<Arc<str>>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attaches a receiver index (saturates at `u32::MAX`).
    #[inline]
    pub fn with_receiver(mut self, index: usize) -> Self {
        self.receiver_index = Some(u32::try_from(index).unwrap_or(u32::MAX));
        self
    }

    #[inline]
    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches an elapsed duration (stored as milliseconds).
    #[inline]
    pub fn with_elapsed(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.elapsed_ms = Some(ms);
        self
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        let mut ev = Event::new(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={reason}"));
        ev.subscriber = Some(subscriber);
        ev
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        let mut ev = Event::new(EventKind::SubscriberPanicked).with_reason(info);
        ev.subscriber = Some(subscriber);
        ev
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }
}

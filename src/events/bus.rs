//! # Event bus for broadcasting queue events.
//!
//! [`Bus`] is a thin wrapper around [`tokio::sync::broadcast`] that provides
//! non-blocking event publishing from the queue actor and the subscriber workers.
//!
//! ## Architecture
//! ```text
//! Publishers:                          Subscribers:
//!   queue actor ──┐                ┌──► subscriber_listener ────► SubscriberSet
//!   sub workers ──┴──────► Bus ────┤     (spawned by QueueBuilder)
//!                   (broadcast chan)└──► QueueHandle::subscribe() receivers
//! ```
//!
//! ## What goes over it
//! One bus per queue, created by `QueueBuilder::spawn` with `bus_capacity` slots.
//! - record lifecycle: `Enqueued`, `Replaced`, `DispatchStarted`, `ResultDelivered`,
//!   `Retired`, `HungDiscarded`, `DispatchFault`
//! - per receiver: `ReceiverDelivered`, `ReceiverFinished`, `ReceiverSkipped`,
//!   `ReceiverDiscarded`, `ProcessStartRequested`, `ReceiverTimeout`, `AnrReported`,
//!   `DeliveryFailed`, `WaitingServices`, `PackageReceiversRemoved`
//! - deferral: `UidDeferred`, `BroadcastSplit`, `FragmentDeferred`, `DeferralsCancelled`
//! - subscriber health, from the workers: `SubscriberOverflow`, `SubscriberPanicked`
//!
//! Every queue-side event carries the queue name; record events add the record id
//! and the intent action.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never blocks; it calls `broadcast::Sender::send`.
//! - **Bounded capacity**: a single ring buffer stores recent events for all receivers.
//! - **Lag handling**: slow receivers get `RecvError::Lagged(n)` and skip `n` oldest items.
//! - **No persistence**: events are lost if there are no active subscribers at send time.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for queue events.
///
/// ### Properties
/// - **Non-blocking**: `publish()` returns immediately (send clones internally).
/// - **Fire-and-forget**: no delivery or durability guarantees.
/// - **Cloneable**: cheap to clone (internally holds an `Arc`-backed sender).
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a new bus with the given channel capacity.
    ///
    /// The minimum capacity is 1 (clamped).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel::<Event>(capacity);
        Self { tx }
    }

    /// Publishes an event to all active subscribers.
    ///
    /// If there are no receivers, the event is dropped (this function still returns immediately).
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a new receiver that will observe subsequent events.
    ///
    /// - Each call creates an **independent** receiver.
    /// - A receiver only gets events **sent after** it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

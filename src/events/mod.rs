//! Queue events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by the queue actor and subscriber workers.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `BroadcastQueue` (inside the actor), `SubscriberSet` workers
//!   (overflow/panic).
//! - **Consumers**: the subscriber listener spawned by `QueueBuilder::spawn` (fans out
//!   to `SubscriberSet`) and any receiver obtained from `QueueHandle::subscribe`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};

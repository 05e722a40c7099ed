//! # Event subscribers for broadcast queues.
//!
//! This module provides the [`Subscribe`] trait, the [`SubscriberSet`] fan-out and
//! built-in implementations for handling events published on the
//! [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   BroadcastQueue ── publish(Event) ──► Bus ──► subscriber_listener
//!                                                      │
//!                                                      ▼
//!                                               SubscriberSet::emit
//!                                          ┌──────────┬──────────┐
//!                                          ▼          ▼          ▼
//!                                      LogWriter   Metrics    Custom
//! ```

#[cfg(feature = "logging")]
mod embedded;
mod set;
mod subscriber;

#[cfg(feature = "logging")]
pub use embedded::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;

//! # broadcastq
//!
//! **broadcastq** is an ordered/parallel broadcast dispatch queue.
//!
//! A broadcast is one send request (an [`Intent`] plus the [`Receiver`]s that
//! matched it). A queue delivers it either to every receiver at once (parallel) or
//! to one receiver at a time, waiting for each to finish and threading a result
//! through the chain (ordered). Around that core it handles per-receiver timeouts
//! and ANR reporting, cold process starts, per-uid deferral of slow apps, and keeps
//! history and statistics for dumps.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   caller ──► QueueHandle ── Command (mpsc) ──► QueueActor (one tokio task)
//!                  ▲                                   │ owns
//!                  │ oneshot replies                   ▼
//!                  │                  ┌─────────────────────────────────────┐
//!                  │                  │ BroadcastQueue                      │
//!                  │                  │  - RecordArena (owns every record)  │
//!                  │                  │  - parallel list                    │
//!                  │                  │  - Dispatcher (ordered + deferrals) │
//!                  │                  │  - history / stats                  │
//!                  │                  └──────┬──────────────────────┬───────┘
//!                  │                         │ calls                │ publishes
//!                  │                         ▼                      ▼
//!                  │         Host: ProcessManager          Bus (broadcast channel)
//!                  │               ReceiverTransport                │
//!                  │               AnrReporter                      ▼
//!                  │                         │          subscriber_listener
//!                  └── finish_receiver ◄─────┘                │
//!                      process_attached                       ▼
//!                                                      SubscriberSet
//!                                                 ┌──────────┼──────────┐
//!                                                 ▼          ▼          ▼
//!                                              worker1    worker2    workerN
//! ```
//!
//! ### Ordered record lifecycle
//! ```text
//! enqueue ──► backlog ──► active ──► next receiver
//!                           │          ├─ uid deferring  ─► split / park fragment
//!                           │          ├─ skip policy    ─► Skipped, next
//!                           │          ├─ registered     ─► perform_receive, wait finish
//!                           │          └─ manifest       ─► schedule in running process
//!                           │                               or start process, wait attach
//!                           │
//!                           ├─ finish ack / timeout / process death ─► next receiver
//!                           ├─ hung (2 × timeout × receivers)       ─► forced out
//!                           └─ exhausted or aborted ─► final result, stats, history
//! ```
//!
//! ## Features
//! | Area               | Description                                                   | Key types / traits                                  |
//! |--------------------|---------------------------------------------------------------|-----------------------------------------------------|
//! | **Queue**          | Spawn a queue and drive it from any task.                      | [`QueueBuilder`], [`QueueHandle`]                   |
//! | **Records**        | What is sent, to whom, and how far delivery got.              | [`BroadcastRecord`], [`Intent`], [`Receiver`]       |
//! | **Host**           | Process management, delivery transport and ANR reporting.     | [`ProcessManager`], [`ReceiverTransport`], [`AnrReporter`] |
//! | **Policies**       | Delivery gate and slow-uid hold-back.                         | [`SkipPolicy`], [`RuleSkipPolicy`], [`DeferralPolicy`] |
//! | **Subscriber API** | Hook into queue events (logging, metrics, custom).            | [`Subscribe`], [`Event`]                            |
//! | **Introspection**  | History, per-action stats and a JSON dump.                    | [`QueueDump`], [`BroadcastStats`]                   |
//! | **Configuration**  | Timeouts, deferral and history sizes with string overrides.   | [`BroadcastConstants`]                              |
//! | **Errors**         | Typed errors for callers and transports.                      | [`QueueError`], [`DeliveryError`], [`ConfigError`]  |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use broadcastq::{
//!     BroadcastConstants, BroadcastRecord, Delivery, DeliveryError, FinishResult, FinishTarget,
//!     Host, Intent, ManifestReceiver, ProcessInfo, ProcessManager, QueueBuilder, ReceiverId,
//!     ReceiverTransport, RegisteredReceiver, Uid,
//! };
//!
//! struct NoProcesses;
//!
//! impl ProcessManager for NoProcesses {
//!     fn running_process(&self, _name: &str, _uid: Uid) -> Option<ProcessInfo> { None }
//!     fn start_process(
//!         &self,
//!         _name: &str,
//!         _receiver: &ManifestReceiver,
//!         _record: &BroadcastRecord,
//!     ) -> Option<ProcessInfo> { None }
//!     fn is_alive(&self, _process: &ProcessInfo) -> bool { false }
//!     fn kill(&self, _process: &ProcessInfo, _reason: &str) {}
//! }
//!
//! struct Print;
//!
//! impl ReceiverTransport for Print {
//!     fn schedule_receiver(
//!         &self,
//!         _process: &ProcessInfo,
//!         _receiver: &ManifestReceiver,
//!         _delivery: &Delivery,
//!     ) -> Result<(), DeliveryError> { Ok(()) }
//!
//!     fn perform_receive(
//!         &self,
//!         target: &RegisteredReceiver,
//!         delivery: &Delivery,
//!     ) -> Result<(), DeliveryError> {
//!         println!("{} <- {} (code {})", target.id, delivery.intent.action, delivery.result_code);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Host::new(Arc::new(NoProcesses), Arc::new(Print));
//!     let queue = QueueBuilder::new("foreground", BroadcastConstants::foreground(), host).spawn();
//!
//!     let receiver = RegisteredReceiver::new(ReceiverId::new(1), 10_001, "com.example");
//!     let record = BroadcastRecord::new(Intent::new("com.example.PING"), vec![receiver.into()])
//!         .with_ordered(true);
//!     queue.enqueue(record).await?;
//!
//!     // The receiver acknowledges; the chain is done.
//!     queue
//!         .finish_receiver(FinishTarget::Receiver(ReceiverId::new(1)), FinishResult::new(0), false)
//!         .await?;
//!     queue.wait_for_idle().await?;
//!     queue.shutdown();
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod host;
mod policies;
mod record;
mod subscribers;

#[cfg(test)]
mod testing;

// ---- Public re-exports ----

pub use core::{
    ActionStats, BroadcastConstants, BroadcastStats, DeferralSnapshot, EnqueueOutcome,
    FinishResult, FinishTarget, HistoryEntry, HistorySummary, PendingSummary, QueueBuilder,
    QueueDump, QueueHandle, RecordSummary, StatsRow,
};
pub use error::{ConfigError, DeliveryError, DispatchFault, QueueError};
pub use events::{Event, EventKind};
pub use host::{
    AnrReporter, Delivery, Host, LogAnrReporter, ProcessInfo, ProcessManager, ReceiverTransport,
    TimeoutRecord,
};
pub use policies::{
    DeferralPolicy, PackageState, PermissivePackages, RuleSkipPolicy, SkipPolicy, SkipReason,
};
pub use record::{
    app_id, is_core_uid, user_id_of, BroadcastRecord, BroadcastResult, CallerInfo,
    ComponentName, DeliveryState, DispatchState, Intent, IntentFlags, ManifestReceiver, Pid,
    Receiver, ReceiverId, RecordId, RegisteredReceiver, SplitToken, Stamp, Timing, Uid, UserId,
    FIRST_APPLICATION_UID, PER_USER_RANGE, RESULT_CANCELED, RESULT_OK,
};
pub use subscribers::{Subscribe, SubscriberSet};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;

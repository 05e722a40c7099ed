//! Broadcast records and the values they are made of.
//!
//! ## Contents
//! - [`BroadcastRecord`] one send request with its per-receiver progress
//! - [`Intent`], [`ComponentName`], [`IntentFlags`] what is broadcast and to whom
//! - [`Receiver`] tagged union of [`RegisteredReceiver`] and [`ManifestReceiver`]
//! - [`RecordId`], [`ReceiverId`], [`SplitToken`] handles used by the scheduler
//! - `RecordArena` (internal) owner of every queued record

mod arena;
mod broadcast;
mod ids;
mod intent;
mod receiver;

pub(crate) use arena::RecordArena;
pub use broadcast::{
    BroadcastRecord, BroadcastResult, CallerInfo, DeliveryState, DispatchState, Stamp, Timing,
    RESULT_CANCELED, RESULT_OK,
};
pub use ids::{
    app_id, is_core_uid, user_id_of, Pid, ReceiverId, RecordId, SplitToken, Uid, UserId,
    FIRST_APPLICATION_UID, PER_USER_RANGE,
};
pub use intent::{ComponentName, Intent, IntentFlags};
pub use receiver::{ManifestReceiver, Receiver, RegisteredReceiver};

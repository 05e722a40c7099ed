//! Error types used by the broadcast queue and its collaborators.
//!
//! This module defines the error enums crossing the crate boundary:
//!
//! - [`QueueError`]: errors returned by a [`QueueHandle`](crate::QueueHandle).
//! - [`DeliveryError`]: failures reported by a [`ReceiverTransport`](crate::ReceiverTransport).
//! - [`ConfigError`]: malformed constants overrides.
//!
//! Internally the scheduler also uses [`DispatchFault`] for logical faults that are
//! contained inside the dispatch loop and never reach the sender.
//!
//! All types provide `as_label` for logs/metrics.

use thiserror::Error;

use crate::record::RecordId;

/// # Errors returned by a queue handle.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue actor has stopped (shutdown or panic); the command was not applied.
    #[error("broadcast queue '{queue}' is closed")]
    Closed {
        /// Name of the queue.
        queue: String,
    },

    /// The record was rejected before it reached the scheduler.
    #[error("invalid broadcast record: {reason}")]
    InvalidRecord {
        /// Why the record was rejected.
        reason: String,
    },
}

impl QueueError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use broadcastq::QueueError;
    ///
    /// let err = QueueError::Closed { queue: "foreground".into() };
    /// assert_eq!(err.as_label(), "queue_closed");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::Closed { .. } => "queue_closed",
            QueueError::InvalidRecord { .. } => "queue_invalid_record",
        }
    }
}

/// # One-way delivery failures.
///
/// Returned by [`ReceiverTransport`](crate::ReceiverTransport) implementations when the
/// call into the receiving process could not be made.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The remote call failed; the process is either dying or wedged.
    #[error("remote call failed: {reason}")]
    Remote {
        /// Transport-specific description.
        reason: String,
    },

    /// The hosting process has no live thread to call into.
    #[error("receiving process is dead")]
    ProcessDead,
}

impl DeliveryError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeliveryError::Remote { .. } => "delivery_remote_failure",
            DeliveryError::ProcessDead => "delivery_process_dead",
        }
    }
}

/// # Logical faults inside the dispatch loop.
///
/// These indicate a bookkeeping bug rather than a misbehaving receiver. The scheduler
/// logs them at `error`, discards the affected record and keeps going.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchFault {
    /// A collection referenced a record id that is no longer in the arena.
    #[error("record {0} is not in the arena")]
    MissingRecord(RecordId),

    /// The receiver cursor points past the end of the receiver list.
    #[error("record {record} has no receiver at index {index}")]
    CursorOutOfRange {
        /// Affected record.
        record: RecordId,
        /// Cursor value.
        index: usize,
    },

    /// A manifest receiver ended up on the parallel list.
    #[error("record {0} has a manifest receiver on the parallel list")]
    ManifestInParallel(RecordId),
}

impl DispatchFault {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchFault::MissingRecord(_) => "fault_missing_record",
            DispatchFault::CursorOutOfRange { .. } => "fault_cursor_out_of_range",
            DispatchFault::ManifestInParallel(_) => "fault_manifest_in_parallel",
        }
    }
}

/// # Errors produced while parsing constants overrides.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An entry was not of the form `key=value`.
    #[error("malformed entry '{entry}': expected key=value")]
    MalformedEntry {
        /// Offending entry.
        entry: String,
    },

    /// A known key carried a value that could not be parsed.
    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue {
        /// Key being set.
        key: String,
        /// Raw value.
        value: String,
    },
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::MalformedEntry { .. } => "config_malformed_entry",
            ConfigError::InvalidValue { .. } => "config_invalid_value",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(DeliveryError::ProcessDead.as_label(), "delivery_process_dead");
        assert_eq!(
            DispatchFault::MissingRecord(RecordId::from_raw(3)).as_label(),
            "fault_missing_record"
        );
        assert_eq!(
            ConfigError::MalformedEntry { entry: "x".into() }.to_string(),
            "malformed entry 'x': expected key=value"
        );
    }
}

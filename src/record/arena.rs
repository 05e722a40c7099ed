//! # RecordArena: owner of every record a queue holds.
//!
//! The parallel list, the ordered backlog, the deferral table and the pending-start
//! slot all refer to records by [`RecordId`]. The arena is the only owner, so a
//! record leaves the queue exactly when it is removed from here.

use std::collections::HashMap;

use super::broadcast::BroadcastRecord;
use super::ids::RecordId;

#[derive(Debug, Default)]
pub(crate) struct RecordArena {
    records: HashMap<RecordId, BroadcastRecord>,
    next_id: u64,
}

impl RecordArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `record` and assigns it a fresh id.
    pub(crate) fn insert(&mut self, mut record: BroadcastRecord) -> RecordId {
        self.next_id += 1;
        let id = RecordId::from_raw(self.next_id);
        record.id = Some(id);
        self.records.insert(id, record);
        id
    }

    #[inline]
    pub(crate) fn get(&self, id: RecordId) -> Option<&BroadcastRecord> {
        self.records.get(&id)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: RecordId) -> Option<&mut BroadcastRecord> {
        self.records.get_mut(&id)
    }

    #[inline]
    pub(crate) fn remove(&mut self, id: RecordId) -> Option<BroadcastRecord> {
        self.records.remove(&id)
    }

    #[inline]
    pub(crate) fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

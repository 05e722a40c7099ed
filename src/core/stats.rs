//! # Per-action dispatch statistics.
//!
//! Keyed by `(action, package)`. Serialized records add one broadcast with their
//! manifest receive/skip counts and dispatch time; background restriction skips are
//! counted against the receiving package.
//!
//! [`BroadcastStats::take`] hands the accumulated table out and starts a fresh one.

use std::collections::BTreeMap;
use std::mem;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::history::epoch_ms;

/// Counters of one `(action, package)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionStats {
    pub broadcasts: u64,
    pub receives: u64,
    pub skips: u64,
    pub total_dispatch_ms: u64,
    pub max_dispatch_ms: u64,
    pub background_violations: u64,
}

/// Flattened row for dumps.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub action: String,
    pub package: String,
    #[serde(flatten)]
    pub stats: ActionStats,
}

/// Statistics table since `since`.
#[derive(Debug, Clone)]
pub struct BroadcastStats {
    since: SystemTime,
    entries: BTreeMap<(String, String), ActionStats>,
}

impl BroadcastStats {
    pub fn new() -> Self {
        Self {
            since: SystemTime::now(),
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn add_broadcast(
        &mut self,
        action: &str,
        package: &str,
        receives: u32,
        skips: u32,
        dispatch: Duration,
    ) {
        let ms = dispatch.as_millis() as u64;
        let s = self.entry(action, package);
        s.broadcasts += 1;
        s.receives += u64::from(receives);
        s.skips += u64::from(skips);
        s.total_dispatch_ms = s.total_dispatch_ms.saturating_add(ms);
        s.max_dispatch_ms = s.max_dispatch_ms.max(ms);
    }

    pub(crate) fn add_background_violation(&mut self, action: &str, package: &str) {
        self.entry(action, package).background_violations += 1;
    }

    fn entry(&mut self, action: &str, package: &str) -> &mut ActionStats {
        self.entries
            .entry((action.to_string(), package.to_string()))
            .or_default()
    }

    pub fn get(&self, action: &str, package: &str) -> Option<&ActionStats> {
        self.entries.get(&(action.to_string(), package.to_string()))
    }

    #[inline]
    pub fn since(&self) -> SystemTime {
        self.since
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rows(&self) -> Vec<StatsRow> {
        self.entries
            .iter()
            .map(|((action, package), stats)| StatsRow {
                action: action.clone(),
                package: package.clone(),
                stats: stats.clone(),
            })
            .collect()
    }

    pub(crate) fn since_ms(&self) -> u64 {
        epoch_ms(self.since)
    }

    /// Returns the table and starts a new one.
    pub(crate) fn take(&mut self) -> BroadcastStats {
        mem::take(self)
    }
}

impl Default for BroadcastStats {
    fn default() -> Self {
        Self::new()
    }
}

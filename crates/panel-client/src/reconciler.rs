//! Client-side console log reconciliation.
//!
//! Merges snapshots and live entries into one ordered, duplicate-free view.
//! Entries are kept sorted by `seq`; the common in-order case is a push, an
//! out-of-order arrival is inserted at its sorted position. When the view
//! grows past `max_retained` it is cut down to the newest `trim_to` entries
//! in one step.

use panel_core::LogEntry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default cap on retained entries.
pub const DEFAULT_MAX_RETAINED: usize = 2000;

/// Default size after a trim.
pub const DEFAULT_TRIM_TO: usize = 200;

/// Persistable state of a reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerState {
    pub entries: Vec<LogEntry>,
    /// Highest sequence number discarded by a trim. Anything at or below it
    /// is stale and ignored.
    #[serde(default)]
    pub floor: u64,
}

/// Ordered local view of one process's console.
#[derive(Debug, Clone)]
pub struct ClientReconciler {
    entries: Vec<LogEntry>,
    seen: HashSet<u64>,
    floor: u64,
    max_retained: usize,
    trim_to: usize,
}

impl Default for ClientReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientReconciler {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_RETAINED, DEFAULT_TRIM_TO)
    }

    /// `trim_to` is clamped into `1..=max_retained`.
    pub fn with_limits(max_retained: usize, trim_to: usize) -> Self {
        let max_retained = max_retained.max(1);
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            floor: 0,
            max_retained,
            trim_to: trim_to.clamp(1, max_retained),
        }
    }

    /// Rebuild from cached state, re-applying the ordering and size rules.
    pub fn from_state(state: ReconcilerState) -> Self {
        let mut reconciler = Self::new();
        reconciler.replace(state.entries);
        reconciler.floor = reconciler.floor.max(state.floor);
        reconciler
    }

    pub fn state(&self) -> ReconcilerState {
        ReconcilerState {
            entries: self.entries.clone(),
            floor: self.floor,
        }
    }

    /// Apply a snapshot. Returns whether the view changed.
    pub fn on_snapshot(&mut self, entries: Vec<LogEntry>, reset: bool) -> bool {
        if reset {
            self.replace(entries);
            return true;
        }
        let mut changed = false;
        for entry in entries {
            changed |= self.insert(entry);
        }
        if changed {
            self.trim();
        }
        changed
    }

    /// Apply one live entry. Returns `false` for duplicates and stale entries.
    pub fn on_log(&mut self, entry: LogEntry) -> bool {
        if !self.insert(entry) {
            return false;
        }
        self.trim();
        true
    }

    /// Resume hint: the highest sequence number held.
    pub fn last_seq(&self) -> u64 {
        self.entries.last().map_or(self.floor, |e| e.seq)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: LogEntry) -> bool {
        if entry.seq <= self.floor || self.seen.contains(&entry.seq) {
            return false;
        }
        self.seen.insert(entry.seq);
        match self.entries.last() {
            Some(last) if last.seq > entry.seq => {
                let at = self.entries.partition_point(|e| e.seq < entry.seq);
                self.entries.insert(at, entry);
            }
            _ => self.entries.push(entry),
        }
        true
    }

    /// Replace the view wholesale (sorted, deduplicated, tail-bounded).
    fn replace(&mut self, mut entries: Vec<LogEntry>) {
        entries.sort_by_key(|e| e.seq);
        entries.dedup_by_key(|e| e.seq);

        self.floor = 0;
        if entries.len() > self.max_retained {
            let cut = entries.len() - self.max_retained;
            self.floor = entries[cut - 1].seq;
            entries.drain(..cut);
        }
        self.seen = entries.iter().map(|e| e.seq).collect();
        self.entries = entries;
    }

    fn trim(&mut self) {
        if self.entries.len() <= self.max_retained {
            return;
        }
        let cut = self.entries.len() - self.trim_to;
        for dropped in self.entries.drain(..cut) {
            self.seen.remove(&dropped.seq);
            self.floor = dropped.seq;
        }
    }
}

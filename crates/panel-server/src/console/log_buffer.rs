//! Bounded, sequence-numbered console log for one managed process.
//!
//! Keeps the last N entries so that a reconnecting viewer can resume from
//! its last seen sequence number without the server keeping unbounded history.

use panel_core::LogEntry;
use std::collections::VecDeque;

/// How a resume hint was resolved against the retained entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resume {
    pub entries: Vec<LogEntry>,
    /// The viewer must discard its local log and adopt `entries`.
    pub reset: bool,
}

/// A fixed-capacity, append-only log with oldest-entry eviction.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    /// Sequence number the next append receives.
    next_seq: u64,
}

impl LogBuffer {
    /// Create an empty buffer retaining at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            next_seq: 1,
        }
    }

    /// Assign the next sequence number to `line` and store it, evicting the
    /// oldest entry once over capacity.
    pub fn append(&mut self, line: String) -> LogEntry {
        let entry = LogEntry::new(self.next_seq, line);
        self.next_seq += 1;
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        entry
    }

    /// Seed the buffer from previously recorded entries.
    ///
    /// Entries must be sorted by `seq`; anything at or below the current
    /// newest sequence is ignored so numbering never goes backwards.
    /// `high_water` is the highest number ever issued. If it lies beyond the
    /// restored entries, the entries are discarded and numbering continues
    /// after it, so retained entries stay gap-free and viewers reset.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = LogEntry>, high_water: u64) {
        for entry in entries {
            if entry.seq < self.next_seq {
                continue;
            }
            self.next_seq = entry.seq + 1;
            self.entries.push_back(entry);
        }
        if high_water >= self.next_seq {
            self.entries.clear();
            self.next_seq = high_water + 1;
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Resolve a resume hint.
    ///
    /// * `last_seq == 0`: first connect, full buffer with reset.
    /// * `last_seq` within the retained range: only newer entries, no reset.
    /// * `last_seq` older than the oldest retained entry, or newer than
    ///   anything ever appended (buffer was recreated): full buffer with reset.
    pub fn since(&self, last_seq: u64) -> Resume {
        let newest = self.newest_seq();
        let retained = match self.oldest_seq() {
            Some(oldest) => last_seq >= oldest && last_seq <= newest,
            None => false,
        };

        if last_seq == 0 || !retained {
            return Resume {
                entries: self.entries.iter().cloned().collect(),
                reset: true,
            };
        }

        Resume {
            entries: self
                .entries
                .iter()
                .filter(|e| e.seq > last_seq)
                .cloned()
                .collect(),
            reset: false,
        }
    }

    /// All retained entries in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Sequence of the oldest retained entry.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.entries.front().map(|e| e.seq)
    }

    /// Highest sequence number ever assigned (0 if none).
    pub fn newest_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

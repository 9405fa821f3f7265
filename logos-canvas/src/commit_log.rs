//! Bounded window over the committed operation log.
//!
//! The full log is the single source of truth, but neither the sequencer nor a
//! client needs all of it: rebasing only ever looks at the suffix after some
//! `base_seq`. Records older than the retention window are compacted away and
//! `floor` remembers where the window starts.
//!
//! ```text
//!   floor          available: (floor, head]          head
//!     │ ┌──────┬──────┬──────┬──────┬──────┐          │
//!     └─│ f+1  │ f+2  │ ...  │      │ head │◄─────────┘
//!       └──────┴──────┴──────┴──────┴──────┘
//! ```

use std::collections::VecDeque;

use crate::operation::CommitRecord;

#[derive(Debug, Clone)]
pub struct CommitLog {
    records: VecDeque<CommitRecord>,
    /// Highest sequence number that is no longer retained.
    floor: u64,
    capacity: usize,
}

impl CommitLog {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(0, capacity)
    }

    /// Empty window whose history up to and including `seq` is unavailable
    /// (a log seeded from a snapshot).
    pub fn starting_at(seq: u64, capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            floor: seq,
            capacity: capacity.max(1),
        }
    }

    /// Append the next record. Evicts the oldest record beyond capacity.
    pub fn push(&mut self, record: CommitRecord) {
        debug_assert_eq!(record.seq, self.head() + 1, "commit log must be contiguous");
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            if let Some(evicted) = self.records.pop_front() {
                self.floor = evicted.seq;
            }
        }
    }

    /// Sequence number of the newest record (or the floor when empty).
    pub fn head(&self) -> u64 {
        self.records.back().map_or(self.floor, |r| r.seq)
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Records with `seq > after`, in commit order. `None` when part of that
    /// suffix has been compacted away.
    pub fn since(&self, after: u64) -> Option<impl Iterator<Item = &CommitRecord> + '_> {
        if after < self.floor {
            return None;
        }
        let skip = (after - self.floor) as usize;
        Some(self.records.iter().skip(skip))
    }

    pub fn get(&self, seq: u64) -> Option<&CommitRecord> {
        if seq <= self.floor {
            return None;
        }
        self.records.get((seq - self.floor - 1) as usize)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Central sequencer: the single authority assigning commit order for one
//! document.
//!
//! ```text
//!   Submit(op, base=n)          head = m
//!        │
//!        ▼
//!   validate ─▶ window check ─▶ rebase over (n, m] ─▶ store check
//!                                                       │
//!                              sink.deliver ◀─ log ◀─ apply at seq m+1
//! ```
//!
//! The sequencer is synchronous; callers serialize access per document (the
//! server keeps it behind a mutex in its room). An operation is either fully
//! committed or not at all: every check runs before the store is touched.

use std::sync::Arc;

use logos_canvas::{
    rebase, CommitLog, CommitRecord, DocumentStore, OpId, Operation, OperationError, SiteId,
    Snapshot, TransformError,
};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::broadcast::BroadcastSink;

/// Sequencer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Largest `head - base_seq` the sequencer will rebase over. Clients
    /// further behind must resync from a snapshot.
    pub rebase_window: u64,
    /// Committed records kept for rebasing.
    pub log_retention: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            rebase_window: 1024,
            log_retention: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Malformed(#[from] OperationError),

    #[error("Resync required: base seq {base_seq} is outside the rebase window ({floor}..={head})")]
    ResyncRequired { base_seq: u64, floor: u64, head: u64 },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Sequencer halted after an unsupported transform")]
    Poisoned,
}

impl SequencerError {
    /// Whether the submitting client should be told its operation was
    /// refused (as opposed to being resynced).
    pub fn is_rejection(&self) -> bool {
        !matches!(self, SequencerError::ResyncRequired { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Committing,
    /// An operation pair could not be transformed; the document accepts no
    /// further operations.
    Poisoned,
}

pub struct Sequencer {
    store: DocumentStore,
    log: CommitLog,
    /// Highest committed counter per site.
    site_counters: FxHashMap<SiteId, u64>,
    clock: u64,
    sink: Arc<dyn BroadcastSink>,
    state: SequencerState,
    config: SequencerConfig,
}

impl Sequencer {
    /// Sequencer for an empty document.
    pub fn new(config: SequencerConfig, sink: Arc<dyn BroadcastSink>) -> Self {
        Self::with_store(DocumentStore::new(), config, sink)
    }

    /// Sequencer resuming from a snapshot. History before the snapshot is
    /// unavailable, so clients based earlier must resync.
    pub fn from_snapshot(snapshot: Snapshot, config: SequencerConfig, sink: Arc<dyn BroadcastSink>) -> Self {
        Self::with_store(DocumentStore::from_snapshot(snapshot), config, sink)
    }

    fn with_store(store: DocumentStore, config: SequencerConfig, sink: Arc<dyn BroadcastSink>) -> Self {
        let seq = store.seq();
        Self {
            store,
            log: CommitLog::starting_at(seq, config.log_retention),
            site_counters: FxHashMap::default(),
            clock: seq,
            sink,
            state: SequencerState::Idle,
            config,
        }
    }

    /// Rebase `op` over everything committed since its base, commit it at
    /// `head + 1` and deliver the record to the sink.
    pub fn submit(&mut self, op: Operation) -> Result<CommitRecord, SequencerError> {
        if self.state == SequencerState::Poisoned {
            return Err(SequencerError::Poisoned);
        }
        op.validate()?;

        let head = self.log.head();
        if op.base_seq > head {
            return Err(malformed(op.id, format!("base seq {} is ahead of head {}", op.base_seq, head)));
        }
        if let Some(&last) = self.site_counters.get(&op.id.site) {
            if op.id.counter <= last {
                return Err(malformed(
                    op.id,
                    format!("counter {} does not advance past {}", op.id.counter, last),
                ));
            }
        }

        let resync = SequencerError::ResyncRequired {
            base_seq: op.base_seq,
            floor: self.log.floor(),
            head,
        };
        if head - op.base_seq > self.config.rebase_window {
            log::info!("{} is {} commits behind, forcing resync", op.id, head - op.base_seq);
            return Err(resync);
        }
        let Some(suffix) = self.log.since(op.base_seq) else {
            log::info!("{} is based on compacted history (floor {}), forcing resync", op.id, self.log.floor());
            return Err(resync);
        };

        self.state = SequencerState::Committing;
        let rebased = match rebase(&op, suffix) {
            Ok(rebased) => rebased,
            Err(e) if !e.is_fatal() => {
                self.state = SequencerState::Idle;
                return Err(malformed(op.id, e.to_string()));
            }
            Err(e) => {
                log::error!("Sequencer poisoned by {}: {}", op.id, e);
                self.state = SequencerState::Poisoned;
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.check(&rebased.kind) {
            self.state = SequencerState::Idle;
            return Err(malformed(op.id, e.to_string()));
        }

        self.clock += 1;
        let record = CommitRecord {
            seq: head + 1,
            op: rebased,
            committed_at: self.clock,
        };
        if let Err(e) = self.store.apply(&record) {
            self.state = SequencerState::Idle;
            return Err(malformed(op.id, e.to_string()));
        }
        self.log.push(record.clone());
        self.site_counters.insert(op.id.site, op.id.counter);
        self.sink.deliver(&record);
        self.state = SequencerState::Idle;

        log::debug!(
            "Committed {} at seq {} ({:?}, rebased over {})",
            record.op.id,
            record.seq,
            record.op.kind.tag(),
            head - op.base_seq
        );
        Ok(record)
    }

    /// Sequence number of the last commit.
    pub fn head(&self) -> u64 {
        self.log.head()
    }

    /// Oldest base sequence that can still be rebased.
    pub fn floor(&self) -> u64 {
        self.log.floor()
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == SequencerState::Poisoned
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn log(&self) -> &CommitLog {
        &self.log
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Current authoritative state, for joining or resyncing clients.
    pub fn export_snapshot(&self) -> Snapshot {
        self.store.export_snapshot()
    }
}

fn malformed(op_id: OpId, reason: String) -> SequencerError {
    log::warn!("Rejected {}: {}", op_id, reason);
    SequencerError::Malformed(OperationError::Malformed { op_id, reason })
}

//! Client session: the per-connection state machine between local edits and
//! the sequencer's commit stream.
//!
//! Two stores are kept side by side. `confirmed` is the fold of every commit
//! received so far; `optimistic` is `confirmed` with the pending buffer
//! applied on top and is what the user sees.
//!
//! ```text
//!             local edit                     take_outgoing
//!   Synced ─────────────▶ Pending ──────────────────────────▶ (head in flight)
//!     ▲                     │  ▲ remote commit: rebase pending   │
//!     │   last ack          │  └─────────────────────────────────┤
//!     └─────────────────────┘          own commit: pop head ◀────┘
//!
//!   sequence gap / resync required ──▶ Resyncing ──snapshot──▶ Synced
//! ```
//!
//! Only the head of the pending buffer is ever in flight. Each following
//! operation is sent once the previous one is acknowledged, based on the
//! sequence number of that acknowledgment, so the sequencer never has to
//! rebase an operation over the same site's own commits.
//!
//! Nothing here blocks or touches the network; the async client drives it.

use std::collections::VecDeque;

use logos_canvas::{
    invert, transform, transform_kind, ApplyError, CanvasObject, CommitLog, CommitRecord,
    DocumentStore, FieldPatch, HistoryError, HistoryManager, ObjectDelta, ObjectId, OpId, OpKind,
    Operation, OperationError, SiteId, Snapshot, TransformError, DEFAULT_MAX_HISTORY,
};
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Client session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Unacknowledged operations allowed before local edits are refused.
    pub max_pending: usize,
    /// Received commits kept for undo/redo replay.
    pub log_window: usize,
    /// Undoable entries kept.
    pub max_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending: 1024,
            log_window: 4096,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    History(#[from] HistoryError),

    /// A commit arrived out of order; the session must resync.
    #[error("Missed commits: expected seq {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Session is waiting for a snapshot")]
    Resyncing,

    #[error("Too many unacknowledged operations ({0})")]
    Backpressure(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing pending; the view equals the confirmed document.
    Synced,
    /// Local operations await acknowledgment.
    Pending,
    /// Waiting for a snapshot; edits are refused.
    Resyncing,
}

pub struct ClientSession {
    site: SiteId,
    counter: u64,
    confirmed: DocumentStore,
    optimistic: DocumentStore,
    log: CommitLog,
    pending: VecDeque<Operation>,
    in_flight: bool,
    resyncing: bool,
    /// Objects the view may have diverged on while operations were pending.
    touched: FxHashSet<ObjectId>,
    history: HistoryManager,
    deltas: Vec<ObjectDelta>,
    config: SessionConfig,
}

impl ClientSession {
    /// Session on an empty document.
    pub fn new(site: SiteId, config: SessionConfig) -> Self {
        Self {
            site,
            counter: 0,
            confirmed: DocumentStore::new(),
            optimistic: DocumentStore::new(),
            log: CommitLog::new(config.log_window),
            pending: VecDeque::new(),
            in_flight: false,
            resyncing: false,
            touched: FxHashSet::default(),
            history: HistoryManager::new(site, config.max_history),
            deltas: Vec::new(),
            config,
        }
    }

    /// Session seeded from a snapshot.
    pub fn from_snapshot(site: SiteId, snapshot: Snapshot, config: SessionConfig) -> Self {
        let mut session = Self::new(site, config);
        session.reset_from_snapshot(snapshot);
        session
    }

    // ========================================================================
    // Local edits
    // ========================================================================

    /// Apply a local edit optimistically and queue it for the sequencer.
    pub fn edit(&mut self, kind: OpKind) -> Result<OpId, SessionError> {
        self.ensure_ready()?;
        if self.pending.len() >= self.config.max_pending {
            return Err(SessionError::Backpressure(self.pending.len()));
        }
        self.optimistic.check_live(&kind)?;
        let op = Operation::new(self.peek_id(), self.acked_seq(), kind)?;
        self.enqueue(op.clone())?;
        self.history.record(&op);
        Ok(op.id)
    }

    /// Insert `object`, stamped as owned by this site.
    pub fn insert(&mut self, mut object: CanvasObject) -> Result<OpId, SessionError> {
        object.owner_site = self.site;
        object.version = 0;
        self.edit(OpKind::Insert { object })
    }

    pub fn update(&mut self, target: ObjectId, patch: FieldPatch) -> Result<OpId, SessionError> {
        self.edit(OpKind::Update { target, patch })
    }

    pub fn delete(&mut self, target: ObjectId) -> Result<OpId, SessionError> {
        self.edit(OpKind::Delete { target })
    }

    pub fn reorder(&mut self, target: ObjectId, layer_order: i64) -> Result<OpId, SessionError> {
        self.edit(OpKind::Reorder { target, layer_order })
    }

    /// Several edits committed atomically.
    pub fn group(&mut self, ops: Vec<OpKind>) -> Result<OpId, SessionError> {
        self.edit(OpKind::Group { ops })
    }

    /// Group every following edit into one undoable entry.
    pub fn begin_gesture(&mut self) {
        self.history.begin_gesture();
    }

    pub fn end_gesture(&mut self) {
        self.history.end_gesture();
    }

    /// Revert the most recent entry. `Ok(None)` when the entry no longer has
    /// any effect to revert (for example its objects were deleted remotely).
    pub fn undo(&mut self) -> Result<Option<OpId>, SessionError> {
        self.ensure_ready()?;
        let id = self.peek_id();
        let prepared = self.history.prepare_undo(&self.log, &self.confirmed, id, self.acked_seq())?;
        let op = self.over_pending(prepared)?;
        self.history.finish_undo(op.as_ref());
        self.submit_history(op)
    }

    pub fn redo(&mut self) -> Result<Option<OpId>, SessionError> {
        self.ensure_ready()?;
        let id = self.peek_id();
        let prepared = self.history.prepare_redo(&self.log, &self.confirmed, id, self.acked_seq())?;
        let op = self.over_pending(prepared)?;
        self.history.finish_redo(op.as_ref());
        self.submit_history(op)
    }

    // ========================================================================
    // Sequencer traffic
    // ========================================================================

    /// The next operation to send, if the sequencer is not already working
    /// on one of ours. The operation is based on the last acknowledged seq.
    pub fn take_outgoing(&mut self) -> Option<Operation> {
        if self.in_flight || self.resyncing {
            return None;
        }
        let acked = self.acked_seq();
        let head = self.pending.front_mut()?;
        head.base_seq = acked;
        self.in_flight = true;
        Some(head.clone())
    }

    /// Apply the next commit from the sequencer.
    pub fn receive(&mut self, record: &CommitRecord) -> Result<(), SessionError> {
        if self.resyncing {
            log::trace!("Ignoring commit {} while resyncing", record.seq);
            return Ok(());
        }
        let expected = self.acked_seq() + 1;
        if record.seq < expected {
            log::trace!("Ignoring already applied commit {}", record.seq);
            return Ok(());
        }
        if record.seq > expected {
            log::warn!("Commit gap: expected {}, got {}", expected, record.seq);
            self.resyncing = true;
            return Err(SessionError::SequenceGap {
                expected,
                got: record.seq,
            });
        }

        let own = self.in_flight && self.pending.front().is_some_and(|p| p.id == record.op.id);
        if own {
            self.acknowledge(record)
        } else {
            self.integrate_remote(record)
        }
    }

    /// The sequencer refused the in-flight operation.
    pub fn rejected(&mut self, op_id: OpId) {
        if !self.in_flight || self.pending.front().map(|p| p.id) != Some(op_id) {
            log::warn!("Rejection for {} does not match the in-flight operation", op_id);
            return;
        }
        self.pending.pop_front();
        self.in_flight = false;
        self.history.rejected(op_id);
        self.rebuild_optimistic();
    }

    /// Stop accepting commits and edits until a snapshot arrives.
    pub fn request_resync(&mut self) {
        self.resyncing = true;
    }

    /// Replace all state with `snapshot`. Pending operations are discarded
    /// and history is invalidated.
    pub fn reset_from_snapshot(&mut self, snapshot: Snapshot) {
        let seq = snapshot.seq;
        if !self.pending.is_empty() {
            log::info!("Discarding {} pending operations on resync", self.pending.len());
        }
        for op in self.pending.drain(..) {
            self.history.rejected(op.id);
        }
        self.history.invalidate_all();
        self.in_flight = false;
        self.resyncing = false;

        self.confirmed = DocumentStore::from_snapshot(snapshot);
        self.log = CommitLog::starting_at(seq, self.config.log_window);
        let ids: Vec<ObjectId> = self.optimistic.ids().chain(self.confirmed.ids()).collect();
        let deltas = self.optimistic.resync_from(&self.confirmed, ids);
        self.deltas.extend(deltas);
        self.touched.clear();
        log::info!("Resynced to seq {}", seq);
    }

    // ========================================================================
    // View
    // ========================================================================

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Sequence number of the last commit applied.
    pub fn acked_seq(&self) -> u64 {
        self.confirmed.seq()
    }

    pub fn state(&self) -> SessionState {
        if self.resyncing {
            SessionState::Resyncing
        } else if self.pending.is_empty() {
            SessionState::Synced
        } else {
            SessionState::Pending
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Live object as the user sees it.
    pub fn get(&self, id: ObjectId) -> Option<&CanvasObject> {
        self.optimistic.get(id)
    }

    /// The user's view in paint order.
    pub fn snapshot(&self) -> Vec<CanvasObject> {
        self.optimistic.snapshot()
    }

    pub fn optimistic(&self) -> &DocumentStore {
        &self.optimistic
    }

    pub fn confirmed(&self) -> &DocumentStore {
        &self.confirmed
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Changes to the view since the last call, in application order.
    pub fn drain_deltas(&mut self) -> Vec<ObjectDelta> {
        std::mem::take(&mut self.deltas)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.resyncing {
            return Err(SessionError::Resyncing);
        }
        Ok(())
    }

    fn peek_id(&self) -> OpId {
        OpId::new(self.site, self.counter + 1)
    }

    fn enqueue(&mut self, op: Operation) -> Result<(), SessionError> {
        let deltas = self.optimistic.apply_pending(&op.kind)?;
        self.counter = op.id.counter;
        self.touched.extend(op.kind.object_ids());
        self.deltas.extend(deltas);
        self.pending.push_back(op);
        Ok(())
    }

    /// Carry an operation prepared against `confirmed` over the pending
    /// buffer so it applies on top of the view.
    fn over_pending(&self, prepared: Option<Operation>) -> Result<Option<Operation>, SessionError> {
        let Some(mut op) = prepared else {
            return Ok(None);
        };
        for p in &self.pending {
            op.kind = transform_kind(&p.kind, p.id, &op.kind, op.id)?;
        }
        Ok((!op.is_noop()).then_some(op))
    }

    fn submit_history(&mut self, op: Option<Operation>) -> Result<Option<OpId>, SessionError> {
        match op {
            Some(op) => {
                let id = op.id;
                self.enqueue(op)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn acknowledge(&mut self, record: &CommitRecord) -> Result<(), SessionError> {
        let inverse = invert(&record.op.kind, &self.confirmed);
        self.confirmed.apply(record)?;
        self.log.push(record.clone());
        self.history.observe_commit(record, &inverse);
        self.pending.pop_front();
        self.in_flight = false;

        if self.pending.is_empty() {
            let ids: Vec<ObjectId> = self.touched.drain().collect();
            let deltas = self.optimistic.resync_from(&self.confirmed, ids);
            self.deltas.extend(deltas);
        }
        log::debug!("Acknowledged {} at seq {}", record.op.id, record.seq);
        Ok(())
    }

    fn integrate_remote(&mut self, record: &CommitRecord) -> Result<(), SessionError> {
        // Rebase the buffer: each pending op moves past the remote op, and
        // the remote op moves past each pending op, in buffer order. Nothing
        // is modified until every step has succeeded.
        let mut remote = record.op.clone();
        let mut rebased = VecDeque::with_capacity(self.pending.len());
        for p in &self.pending {
            let step = transform(&remote, p).and_then(|p2| Ok((p2, transform(p, &remote)?)));
            match step {
                Ok((p2, r2)) => {
                    rebased.push_back(p2);
                    remote = r2;
                }
                Err(e) => {
                    log::warn!("Cannot rebase pending work over commit {}: {}", record.seq, e);
                    self.request_resync();
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.confirmed.apply(record) {
            self.request_resync();
            return Err(e.into());
        }
        self.log.push(record.clone());
        self.pending = rebased;

        match self.optimistic.apply_rebased(&remote.kind, record.seq) {
            Ok(deltas) => self.deltas.extend(deltas),
            Err(e) => {
                log::warn!("Remote commit {} did not apply to the view ({}); rebuilding", record.seq, e);
                self.rebuild_optimistic();
            }
        }
        if self.pending.is_empty() && !self.touched.is_empty() {
            let ids: Vec<ObjectId> = self.touched.drain().collect();
            let deltas = self.optimistic.resync_from(&self.confirmed, ids);
            self.deltas.extend(deltas);
        }
        Ok(())
    }

    /// Recompute the view as `confirmed` plus the pending buffer, dropping
    /// pending operations that no longer apply.
    fn rebuild_optimistic(&mut self) {
        let mut view = self.confirmed.clone();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for (position, op) in self.pending.drain(..).enumerate() {
            let in_flight = position == 0 && self.in_flight;
            match view.apply_pending(&op.kind) {
                Ok(_) => kept.push_back(op),
                Err(e) if in_flight => {
                    // The sequencer already has it; its commit or rejection will settle it.
                    log::warn!("In-flight {} no longer applies locally: {}", op.id, e);
                    kept.push_back(op);
                }
                Err(e) => {
                    log::warn!("Dropping pending {}: {}", op.id, e);
                    self.history.rejected(op.id);
                }
            }
        }
        self.pending = kept;

        let ids: Vec<ObjectId> = self.optimistic.ids().chain(view.ids()).collect();
        let deltas = self.optimistic.resync_from(&view, ids);
        self.deltas.extend(deltas);
        if self.pending.is_empty() {
            self.touched.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_canvas::{Color, Field, FieldValue};

    const LOCAL: SiteId = SiteId(1);
    const REMOTE: SiteId = SiteId(2);

    fn oid(n: u128) -> ObjectId {
        ObjectId::from_u128(n)
    }

    fn rect(n: u128) -> CanvasObject {
        CanvasObject::rectangle(oid(n), LOCAL, 0.0, 0.0, 10.0, 10.0)
    }

    fn fill(c: u8) -> FieldPatch {
        FieldPatch::new().with(Field::Fill, FieldValue::Color(Some(Color::rgb(c, 0, 0))))
    }

    fn session() -> ClientSession {
        ClientSession::new(LOCAL, SessionConfig::default())
    }

    /// Commit the next outgoing operation unchanged at `seq`.
    fn ack(session: &mut ClientSession, seq: u64) -> CommitRecord {
        let op = session.take_outgoing().unwrap();
        let record = CommitRecord {
            seq,
            op,
            committed_at: seq,
        };
        session.receive(&record).unwrap();
        record
    }

    fn remote(seq: u64, counter: u64, kind: OpKind) -> CommitRecord {
        CommitRecord {
            seq,
            op: Operation {
                id: OpId::new(REMOTE, counter),
                base_seq: seq - 1,
                kind,
            },
            committed_at: seq,
        }
    }

    #[test]
    fn test_local_edit_is_optimistic() {
        let mut s = session();
        s.insert(rect(1)).unwrap();

        assert!(s.get(oid(1)).is_some());
        assert!(s.confirmed().get(oid(1)).is_none());
        assert_eq!(s.state(), SessionState::Pending);
        assert_eq!(s.drain_deltas(), vec![ObjectDelta::Created(oid(1))]);
    }

    #[test]
    fn test_only_head_in_flight() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        s.update(oid(1), fill(3)).unwrap();

        let first = s.take_outgoing().unwrap();
        assert_eq!(first.base_seq, 0);
        assert!(s.take_outgoing().is_none());

        s.receive(&CommitRecord {
            seq: 1,
            op: first,
            committed_at: 1,
        })
        .unwrap();
        let second = s.take_outgoing().unwrap();
        assert_eq!(second.base_seq, 1);
        assert_eq!(second.id.counter, 2);
    }

    #[test]
    fn test_ack_drains_to_synced() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        ack(&mut s, 1);

        assert_eq!(s.state(), SessionState::Synced);
        assert_eq!(s.acked_seq(), 1);
        assert_eq!(s.optimistic().versions(), s.confirmed().versions());
        assert_eq!(s.snapshot(), s.confirmed().snapshot());
    }

    #[test]
    fn test_remote_commit_rebases_pending() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        ack(&mut s, 1);

        s.update(oid(1), fill(1)).unwrap();
        s.receive(&remote(2, 1, OpKind::Delete { target: oid(1) })).unwrap();

        assert!(s.get(oid(1)).is_none());
        let pending: Vec<&Operation> = s.pending().collect();
        assert!(pending[0].is_noop());
        assert_eq!(s.take_outgoing().unwrap().base_seq, 2);
    }

    #[test]
    fn test_remote_field_loses_to_pending_with_larger_id() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        ack(&mut s, 1);

        // Local (1, 2) against remote (2, 1): remote id is larger and wins.
        s.update(oid(1), fill(10)).unwrap();
        s.receive(&remote(2, 1, OpKind::Update { target: oid(1), patch: fill(20) })).unwrap();

        assert_eq!(s.get(oid(1)).unwrap().style.fill, Some(Color::rgb(20, 0, 0)));
        assert!(s.pending().next().unwrap().is_noop());
    }

    #[test]
    fn test_stale_local_edit_refused() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        ack(&mut s, 1);
        s.receive(&remote(2, 1, OpKind::Delete { target: oid(1) })).unwrap();

        let err = s.update(oid(1), fill(1)).unwrap_err();
        assert_eq!(err, SessionError::Apply(ApplyError::StaleTarget(oid(1))));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn test_rejection_rebuilds_view() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        s.update(oid(1), fill(5)).unwrap();

        let head = s.take_outgoing().unwrap();
        s.rejected(head.id);

        // The update depended on the rejected insert.
        assert_eq!(s.pending_len(), 0);
        assert!(s.get(oid(1)).is_none());
        assert!(!s.can_undo());
    }

    #[test]
    fn test_gap_enters_resync() {
        let mut s = session();
        let err = s.receive(&remote(3, 1, OpKind::Insert { object: rect(1) })).unwrap_err();
        assert_eq!(err, SessionError::SequenceGap { expected: 1, got: 3 });
        assert_eq!(s.state(), SessionState::Resyncing);
        assert_eq!(s.insert(rect(2)).unwrap_err(), SessionError::Resyncing);
    }

    #[test]
    fn test_failed_rebase_leaves_state_untouched() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        s.take_outgoing().unwrap();
        s.update(oid(1), fill(4)).unwrap();
        let before: Vec<Operation> = s.pending().cloned().collect();

        // A remote insert claiming the same id cannot be carried over pending work.
        let object = CanvasObject::rectangle(oid(1), REMOTE, 5.0, 5.0, 1.0, 1.0);
        let err = s.receive(&remote(1, 1, OpKind::Insert { object })).unwrap_err();
        assert_eq!(err, SessionError::Transform(TransformError::IdCollision { id: oid(1) }));

        assert_eq!(s.state(), SessionState::Resyncing);
        assert_eq!(s.acked_seq(), 0);
        assert!(s.confirmed().get(oid(1)).is_none());
        assert_eq!(s.pending().cloned().collect::<Vec<_>>(), before);
    }

    #[test]
    fn test_snapshot_discards_pending() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        s.request_resync();
        s.drain_deltas();

        let mut authority = DocumentStore::new();
        authority.apply_rebased(&OpKind::Insert { object: rect(7) }, 4).unwrap();
        s.reset_from_snapshot(authority.export_snapshot());

        assert_eq!(s.state(), SessionState::Synced);
        assert_eq!(s.acked_seq(), 4);
        assert!(s.get(oid(1)).is_none());
        assert!(s.get(oid(7)).is_some());
        let deltas = s.drain_deltas();
        assert!(deltas.contains(&ObjectDelta::Deleted(oid(1))));
        assert!(deltas.contains(&ObjectDelta::Created(oid(7))));
    }

    #[test]
    fn test_duplicate_commit_ignored() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        let record = ack(&mut s, 1);
        s.receive(&record).unwrap();
        assert_eq!(s.acked_seq(), 1);
    }

    #[test]
    fn test_undo_goes_through_pending() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        ack(&mut s, 1);

        let undo_id = s.undo().unwrap().unwrap();
        assert!(s.get(oid(1)).is_none());
        assert!(s.can_redo());

        let op = s.take_outgoing().unwrap();
        assert_eq!(op.id, undo_id);
        assert_eq!(op.kind, OpKind::Delete { target: oid(1) });
        s.receive(&CommitRecord {
            seq: 2,
            op,
            committed_at: 2,
        })
        .unwrap();

        s.redo().unwrap();
        ack(&mut s, 3);
        assert!(s.get(oid(1)).is_some());
        assert_eq!(s.confirmed().get(oid(1)).unwrap().geometry.width, 10.0);
    }

    #[test]
    fn test_undo_requires_acknowledgment() {
        let mut s = session();
        s.insert(rect(1)).unwrap();
        assert!(matches!(
            s.undo(),
            Err(SessionError::History(HistoryError::Unacknowledged(_)))
        ));
    }

    #[test]
    fn test_backpressure() {
        let mut s = ClientSession::new(
            LOCAL,
            SessionConfig {
                max_pending: 2,
                ..SessionConfig::default()
            },
        );
        s.insert(rect(1)).unwrap();
        s.insert(rect(2)).unwrap();
        assert_eq!(s.insert(rect(3)).unwrap_err(), SessionError::Backpressure(2));
    }
}

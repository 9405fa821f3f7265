//! Undo/redo for the local site.
//!
//! Each site keeps its own stacks of [`HistoryEntry`]s covering edits it
//! authored. Inverses are computed from the confirmed document at the moment
//! an operation commits, so they describe what the operation actually did
//! after server-side rebasing. Undo and redo replay those inverses as one
//! grouped operation, transformed over everything other sites committed
//! since.
//!
//! ```text
//!   gesture ──end──▶ undo stack ──undo──▶ redo stack
//!                        ▲                    │
//!                        └────────redo────────┘
//!   new gesture: redo stack ──▶ invalidated
//! ```

use std::collections::VecDeque;

use thiserror::Error;

use crate::commit_log::CommitLog;
use crate::object::{ObjectId, SiteId};
use crate::operation::{CommitRecord, OpId, OpKind, OpTag, Operation};
use crate::store::DocumentStore;
use crate::transform::{transform_kind, TransformError};

/// Default number of undoable entries kept per site.
pub const DEFAULT_MAX_HISTORY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("Nothing to undo")]
    NothingToUndo,

    #[error("Nothing to redo")]
    NothingToRedo,

    #[error("History entry {0} still has unacknowledged operations")]
    Unacknowledged(u64),

    #[error("Commit log no longer reaches back to seq {0}")]
    HistoryTruncated(u64),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

/// Inverse of `kind`, computed against the state `kind` is about to be
/// applied to. Edits of tombstoned objects invert to no-ops.
pub fn invert(kind: &OpKind, store: &DocumentStore) -> OpKind {
    match kind {
        OpKind::Insert { object } => OpKind::Delete { target: object.id },
        OpKind::Update { target, patch } => match store.get(*target) {
            Some(object) => OpKind::Update {
                target: *target,
                patch: patch.capture(object),
            },
            None => noop(*target, OpTag::Update),
        },
        OpKind::Delete { target } => match store.get(*target) {
            Some(object) => OpKind::Insert { object: object.clone() },
            None => noop(*target, OpTag::Delete),
        },
        OpKind::Reorder { target, .. } => match store.get(*target) {
            Some(object) => OpKind::Reorder {
                target: *target,
                layer_order: object.layer_order,
            },
            None => noop(*target, OpTag::Reorder),
        },
        OpKind::Group { ops } => {
            let mut scratch = store.scratch(kind.object_ids());
            let mut inverses = Vec::with_capacity(ops.len());
            for sub in ops {
                inverses.push(invert(sub, &scratch));
                if let Err(e) = scratch.apply_pending(sub) {
                    log::warn!("Group member could not be simulated for inversion: {e}");
                }
            }
            inverses.reverse();
            OpKind::Group { ops: inverses }
        }
        OpKind::Noop { .. } => kind.clone(),
    }
}

fn noop(target: ObjectId, shadowed: OpTag) -> OpKind {
    OpKind::Noop {
        target: Some(target),
        shadowed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Forward operations are in effect.
    Active,
    /// Undo operations are in effect; the entry sits on the redo stack.
    Undone,
    /// Dropped from the stacks (history cap, new gesture, rejection, resync).
    Invalidated,
}

/// Operations submitted as one unit together with their committed forms.
#[derive(Debug, Clone, Default, PartialEq)]
struct Batch {
    ops: Vec<Operation>,
    /// Inverse of each committed op, in commit order.
    inverses: Vec<OpKind>,
    range: Option<(u64, u64)>,
    outstanding: Vec<OpId>,
}

impl Batch {
    fn expecting(id: OpId) -> Self {
        Self {
            outstanding: vec![id],
            ..Self::default()
        }
    }

    fn commit(&mut self, record: &CommitRecord, inverse: &OpKind) -> bool {
        let Some(pos) = self.outstanding.iter().position(|id| *id == record.op.id) else {
            return false;
        };
        self.outstanding.remove(pos);
        self.ops.push(record.op.clone());
        self.inverses.push(inverse.clone());
        self.range = Some(match self.range {
            Some((min, max)) => (min.min(record.seq), max.max(record.seq)),
            None => (record.seq, record.seq),
        });
        true
    }

    fn forget(&mut self, id: OpId) -> bool {
        let before = self.outstanding.len();
        self.outstanding.retain(|o| *o != id);
        before != self.outstanding.len()
    }

    fn is_settled(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Inverses in undo order, flattened into a single kind. `None` when the
    /// batch had no effect.
    fn replay_kind(&self) -> Option<OpKind> {
        let mut ops = Vec::new();
        for inverse in self.inverses.iter().rev() {
            match inverse {
                OpKind::Group { ops: members } => ops.extend(members.iter().filter(|k| !k.is_noop()).cloned()),
                other if other.is_noop() => {}
                other => ops.push(other.clone()),
            }
        }
        match ops.len() {
            0 => None,
            1 => ops.pop(),
            _ => Some(OpKind::Group { ops }),
        }
    }
}

/// One undoable unit (a completed gesture).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub entry_id: u64,
    pub origin_site: SiteId,
    pub state: EntryState,
    forward: Batch,
    undo: Batch,
}

impl HistoryEntry {
    fn new(entry_id: u64, origin_site: SiteId) -> Self {
        Self {
            entry_id,
            origin_site,
            state: EntryState::Active,
            forward: Batch::default(),
            undo: Batch::default(),
        }
    }

    /// Operations currently in effect for this entry, as committed.
    pub fn forward_ops(&self) -> &[Operation] {
        &self.forward.ops
    }

    /// Inverse of each forward op, in the order an undo applies them.
    pub fn inverse_ops(&self) -> Vec<OpKind> {
        self.forward.inverses.iter().rev().cloned().collect()
    }

    /// `[min_seq, max_seq]` of the forward ops.
    pub fn sequence_range(&self) -> Option<(u64, u64)> {
        self.forward.range
    }

    pub fn is_acknowledged(&self) -> bool {
        self.forward.is_settled() && self.undo.is_settled()
    }

    fn is_empty(&self) -> bool {
        self.forward.ops.is_empty() && self.forward.outstanding.is_empty()
    }

    fn batches_mut(&mut self) -> [&mut Batch; 2] {
        [&mut self.forward, &mut self.undo]
    }
}

#[derive(Debug, Clone)]
pub struct HistoryManager {
    site: SiteId,
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: Vec<HistoryEntry>,
    gesture: Option<HistoryEntry>,
    /// Entries removed from the stacks, kept for inspection.
    retired: VecDeque<HistoryEntry>,
    next_entry_id: u64,
    max_history: usize,
}

impl HistoryManager {
    pub fn new(site: SiteId, max_history: usize) -> Self {
        Self {
            site,
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            gesture: None,
            retired: VecDeque::new(),
            next_entry_id: 1,
            max_history: max_history.max(1),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Most recent undoable entry.
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo_stack.back()
    }

    pub fn retired(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.retired.iter()
    }

    /// Open a gesture; every operation recorded until `end_gesture` becomes
    /// one entry.
    pub fn begin_gesture(&mut self) {
        if self.gesture.is_none() {
            let entry = HistoryEntry::new(self.next_entry_id, self.site);
            self.next_entry_id += 1;
            self.gesture = Some(entry);
        }
    }

    /// Track a locally created operation. Outside a gesture the operation
    /// forms an entry of its own.
    pub fn record(&mut self, op: &Operation) {
        let standalone = self.gesture.is_none();
        self.begin_gesture();
        if let Some(gesture) = self.gesture.as_mut() {
            gesture.forward.outstanding.push(op.id);
        }
        if standalone {
            self.end_gesture();
        }
    }

    /// Close the open gesture and push it onto the undo stack.
    pub fn end_gesture(&mut self) {
        let Some(entry) = self.gesture.take() else {
            return;
        };
        if entry.is_empty() {
            return;
        }
        for mut stale in self.redo_stack.drain(..) {
            stale.state = EntryState::Invalidated;
            self.retired.push_back(stale);
        }
        self.undo_stack.push_back(entry);
        while self.undo_stack.len() > self.max_history {
            if let Some(mut oldest) = self.undo_stack.pop_front() {
                log::debug!("History cap reached, dropping entry {}", oldest.entry_id);
                oldest.state = EntryState::Invalidated;
                self.retired.push_back(oldest);
            }
        }
        self.trim_retired();
    }

    /// Record the committed form of one of this site's operations together
    /// with its inverse.
    pub fn observe_commit(&mut self, record: &CommitRecord, inverse: &OpKind) {
        for entry in self.entries_mut() {
            for batch in entry.batches_mut() {
                if batch.commit(record, inverse) {
                    return;
                }
            }
        }
    }

    /// The sequencer refused one of our operations.
    pub fn rejected(&mut self, op_id: OpId) {
        if let Some(gesture) = self.gesture.as_mut() {
            if gesture.forward.forget(op_id) {
                return;
            }
        }
        if let Some(pos) = self.undo_stack.iter().position(|e| e.forward.outstanding.contains(&op_id)) {
            let entry = &mut self.undo_stack[pos];
            entry.forward.forget(op_id);
            if entry.is_empty() {
                self.retire_undo(pos);
            }
            return;
        }
        if let Some(pos) = self.redo_stack.iter().position(|e| e.undo.outstanding.contains(&op_id)) {
            let mut entry = self.redo_stack.remove(pos);
            log::warn!("Undo of entry {} was rejected; entry invalidated", entry.entry_id);
            entry.state = EntryState::Invalidated;
            self.retired.push_back(entry);
            self.trim_retired();
        }
    }

    /// Build the operation that undoes the most recent entry, transformed
    /// over the log suffix committed after it. `confirmed` is the document at
    /// `base_seq`. `Ok(None)` when the entry no longer has any effect to
    /// revert.
    pub fn prepare_undo(
        &self,
        log: &CommitLog,
        confirmed: &DocumentStore,
        id: OpId,
        base_seq: u64,
    ) -> Result<Option<Operation>, HistoryError> {
        let entry = self.undo_stack.back().ok_or(HistoryError::NothingToUndo)?;
        if !entry.is_acknowledged() {
            return Err(HistoryError::Unacknowledged(entry.entry_id));
        }
        self.replay(&entry.forward, log, confirmed, id, base_seq)
    }

    /// Move the top entry to the redo stack; `submitted` is the undo
    /// operation sent to the sequencer, if any.
    pub fn finish_undo(&mut self, submitted: Option<&Operation>) {
        let Some(mut entry) = self.undo_stack.pop_back() else {
            return;
        };
        entry.state = EntryState::Undone;
        entry.undo = submitted.map(|op| Batch::expecting(op.id)).unwrap_or_default();
        self.redo_stack.push(entry);
    }

    /// Build the operation that re-applies the most recently undone entry.
    pub fn prepare_redo(
        &self,
        log: &CommitLog,
        confirmed: &DocumentStore,
        id: OpId,
        base_seq: u64,
    ) -> Result<Option<Operation>, HistoryError> {
        let entry = self.redo_stack.last().ok_or(HistoryError::NothingToRedo)?;
        if !entry.is_acknowledged() {
            return Err(HistoryError::Unacknowledged(entry.entry_id));
        }
        self.replay(&entry.undo, log, confirmed, id, base_seq)
    }

    pub fn finish_redo(&mut self, submitted: Option<&Operation>) {
        let Some(mut entry) = self.redo_stack.pop() else {
            return;
        };
        entry.state = EntryState::Active;
        entry.forward = submitted.map(|op| Batch::expecting(op.id)).unwrap_or_default();
        entry.undo = Batch::default();
        self.undo_stack.push_back(entry);
    }

    /// Drop every entry (after a snapshot resync the log suffix the entries
    /// depend on is gone).
    pub fn invalidate_all(&mut self) {
        let gesture = self.gesture.take();
        let entries: Vec<HistoryEntry> = self
            .undo_stack
            .drain(..)
            .chain(self.redo_stack.drain(..))
            .chain(gesture)
            .collect();
        for mut entry in entries {
            entry.state = EntryState::Invalidated;
            self.retired.push_back(entry);
        }
        self.trim_retired();
    }

    /// Inverse of `batch` for the current document. Later commits from other
    /// sites win over the replayed values; this site's own later commits
    /// belong to entries above this one and are skipped.
    fn replay(
        &self,
        batch: &Batch,
        log: &CommitLog,
        confirmed: &DocumentStore,
        id: OpId,
        base_seq: u64,
    ) -> Result<Option<Operation>, HistoryError> {
        let (Some(mut kind), Some((_, max_seq))) = (batch.replay_kind(), batch.range) else {
            return Ok(None);
        };
        let suffix = log.since(max_seq).ok_or(HistoryError::HistoryTruncated(max_seq))?;
        for record in suffix.filter(|r| r.seq <= base_seq && r.op.id.site != self.site) {
            kind = mask_overwritten(kind, &record.op.kind);
            kind = transform_kind(&record.op.kind, record.op.id, &kind, id)?;
        }
        let kind = reconcile(kind, confirmed);
        if kind.is_noop() {
            return Ok(None);
        }
        Ok(Some(Operation { id, base_seq, kind }))
    }

    fn retire_undo(&mut self, pos: usize) {
        if let Some(mut entry) = self.undo_stack.remove(pos) {
            log::warn!("History entry {} invalidated after rejection", entry.entry_id);
            entry.state = EntryState::Invalidated;
            self.retired.push_back(entry);
            self.trim_retired();
        }
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut HistoryEntry> {
        self.gesture
            .iter_mut()
            .chain(self.undo_stack.iter_mut().rev())
            .chain(self.redo_stack.iter_mut().rev())
    }

    fn trim_retired(&mut self) {
        while self.retired.len() > self.max_history {
            self.retired.pop_front();
        }
    }
}

/// Drop the parts of `kind` that a later commit overwrote.
fn mask_overwritten(kind: OpKind, later: &OpKind) -> OpKind {
    match (kind, later) {
        (kind, OpKind::Group { ops }) => ops.iter().fold(kind, mask_overwritten),
        (OpKind::Group { ops }, later) => OpKind::Group {
            ops: ops.into_iter().map(|sub| mask_overwritten(sub, later)).collect(),
        },
        (OpKind::Update { target, mut patch }, OpKind::Update { target: t, patch: p }) if target == *t => {
            patch.retain(|field| !p.contains(field));
            if patch.is_empty() {
                noop(target, OpTag::Update)
            } else {
                OpKind::Update { target, patch }
            }
        }
        (OpKind::Reorder { target, .. }, OpKind::Reorder { target: t, .. }) if target == *t => {
            noop(target, OpTag::Reorder)
        }
        (OpKind::Insert { object }, OpKind::Insert { object: o }) if object.id == o.id => {
            noop(object.id, OpTag::Insert)
        }
        (kind, _) => kind,
    }
}

/// Neutralise members that no longer apply to `confirmed`, simulating the
/// group in order.
fn reconcile(kind: OpKind, confirmed: &DocumentStore) -> OpKind {
    let mut scratch = confirmed.scratch(kind.object_ids());
    match kind {
        OpKind::Group { ops } => OpKind::Group {
            ops: ops.into_iter().map(|sub| admit(sub, &mut scratch)).collect(),
        },
        other => admit(other, &mut scratch),
    }
}

fn admit(kind: OpKind, scratch: &mut DocumentStore) -> OpKind {
    if let Err(e) = scratch.check_live(&kind) {
        log::trace!("Dropping history step: {e}");
        return kind.to_noop();
    }
    if let Err(e) = scratch.apply_pending(&kind) {
        log::warn!("History step could not be simulated: {e}");
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CanvasObject, Color, Field, FieldPatch, FieldValue, ObjectId};

    const SITE: SiteId = SiteId(1);
    const REMOTE: SiteId = SiteId(2);
    const O: ObjectId = ObjectId::from_u128(10);

    struct Doc {
        store: DocumentStore,
        log: CommitLog,
        history: HistoryManager,
        counter: u64,
    }

    impl Doc {
        fn new() -> Self {
            Self {
                store: DocumentStore::new(),
                log: CommitLog::new(64),
                history: HistoryManager::new(SITE, DEFAULT_MAX_HISTORY),
                counter: 0,
            }
        }

        fn next_id(&mut self, site: SiteId) -> OpId {
            self.counter += 1;
            OpId::new(site, self.counter)
        }

        /// Commit an op as the sequencer would; local ops feed history.
        fn commit(&mut self, op: Operation) {
            let seq = self.store.seq() + 1;
            let record = CommitRecord {
                seq,
                op,
                committed_at: seq,
            };
            if record.op.id.site == SITE {
                let inverse = invert(&record.op.kind, &self.store);
                self.history.observe_commit(&record, &inverse);
            }
            self.store.apply(&record).unwrap();
            self.log.push(record);
        }

        fn local(&mut self, kind: OpKind) {
            let op = Operation {
                id: self.next_id(SITE),
                base_seq: self.store.seq(),
                kind,
            };
            self.history.record(&op);
            self.commit(op);
        }

        fn remote(&mut self, kind: OpKind) {
            let op = Operation {
                id: self.next_id(REMOTE),
                base_seq: self.store.seq(),
                kind,
            };
            self.commit(op);
        }

        fn undo(&mut self) -> Result<(), HistoryError> {
            let id = self.next_id(SITE);
            let op = self.history.prepare_undo(&self.log, &self.store, id, self.store.seq())?;
            self.history.finish_undo(op.as_ref());
            if let Some(op) = op {
                self.commit(op);
            }
            Ok(())
        }

        fn redo(&mut self) -> Result<(), HistoryError> {
            let id = self.next_id(SITE);
            let op = self.history.prepare_redo(&self.log, &self.store, id, self.store.seq())?;
            self.history.finish_redo(op.as_ref());
            if let Some(op) = op {
                self.commit(op);
            }
            Ok(())
        }
    }

    fn rect() -> CanvasObject {
        CanvasObject::rectangle(O, SITE, 0.0, 0.0, 40.0, 30.0)
    }

    fn fill(c: Color) -> OpKind {
        OpKind::Update {
            target: O,
            patch: FieldPatch::new().with(Field::Fill, FieldValue::Color(Some(c))),
        }
    }

    #[test]
    fn test_invert_each_kind() {
        let mut store = DocumentStore::new();
        let insert = OpKind::Insert { object: rect() };
        assert_eq!(invert(&insert, &store), OpKind::Delete { target: O });
        store.apply_rebased(&insert, 1).unwrap();

        match invert(&fill(Color::BLACK), &store) {
            OpKind::Update { patch, .. } => assert_eq!(patch.get(Field::Fill), Some(&FieldValue::Color(None))),
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(
            invert(&OpKind::Reorder { target: O, layer_order: 9 }, &store),
            OpKind::Reorder { target: O, layer_order: 0 }
        );
        match invert(&OpKind::Delete { target: O }, &store) {
            OpKind::Insert { object } => assert_eq!(object.geometry.width, 40.0),
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_invert_on_tombstone_is_noop() {
        let mut store = DocumentStore::new();
        store.apply_rebased(&OpKind::Insert { object: rect() }, 1).unwrap();
        store.apply_rebased(&OpKind::Delete { target: O }, 2).unwrap();
        assert!(invert(&fill(Color::BLACK), &store).is_noop());
        assert!(invert(&OpKind::Delete { target: O }, &store).is_noop());
    }

    #[test]
    fn test_invert_group_is_reversed_and_sequential() {
        let store = DocumentStore::new();
        let group = OpKind::Group {
            ops: vec![OpKind::Insert { object: rect() }, fill(Color::rgb(5, 5, 5))],
        };
        match invert(&group, &store) {
            OpKind::Group { ops } => {
                assert_eq!(ops.len(), 2);
                assert!(matches!(&ops[0], OpKind::Update { patch, .. }
                    if patch.get(Field::Fill) == Some(&FieldValue::Color(None))));
                assert_eq!(ops[1], OpKind::Delete { target: O });
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn test_undo_redo_roundtrip() {
        let mut doc = Doc::new();
        doc.local(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(255, 0, 0)));

        doc.undo().unwrap();
        assert_eq!(doc.store.get(O).unwrap().style.fill, None);
        doc.undo().unwrap();
        assert!(doc.store.get(O).is_none());

        doc.redo().unwrap();
        assert!(doc.store.get(O).is_some());
        doc.redo().unwrap();
        assert_eq!(doc.store.get(O).unwrap().style.fill, Some(Color::rgb(255, 0, 0)));
        assert_eq!(doc.redo(), Err(HistoryError::NothingToRedo));
    }

    #[test]
    fn test_gesture_undoes_as_one_unit() {
        let mut doc = Doc::new();
        doc.history.begin_gesture();
        doc.local(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(1, 2, 3)));
        doc.local(OpKind::Reorder { target: O, layer_order: 4 });
        doc.history.end_gesture();
        assert_eq!(doc.history.undo_depth(), 1);
        assert_eq!(doc.history.peek_undo().unwrap().forward_ops().len(), 3);
        assert_eq!(doc.history.peek_undo().unwrap().sequence_range(), Some((1, 3)));

        doc.undo().unwrap();
        assert!(doc.store.is_empty());
        doc.redo().unwrap();
        let object = doc.store.get(O).unwrap();
        assert_eq!(object.layer_order, 4);
        assert_eq!(object.style.fill, Some(Color::rgb(1, 2, 3)));
    }

    #[test]
    fn test_undo_skips_fields_overwritten_remotely() {
        let mut doc = Doc::new();
        doc.local(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(9, 9, 9)));
        doc.remote(fill(Color::rgb(0, 200, 0)));
        doc.undo().unwrap();
        // The remote op has a larger id and was committed later.
        assert_eq!(doc.store.get(O).unwrap().style.fill, Some(Color::rgb(0, 200, 0)));
    }

    #[test]
    fn test_undo_after_remote_delete_is_noop() {
        let mut doc = Doc::new();
        doc.remote(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(9, 9, 9)));
        doc.remote(OpKind::Delete { target: O });
        let seq = doc.store.seq();
        doc.undo().unwrap();
        assert!(doc.store.get(O).is_none());
        assert_eq!(doc.store.seq(), seq);
        assert!(doc.history.can_redo());
    }

    #[test]
    fn test_undo_across_own_delete_and_restore() {
        let mut doc = Doc::new();
        doc.remote(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(40, 40, 40)));
        doc.local(OpKind::Delete { target: O });
        doc.undo().unwrap();
        assert!(doc.store.get(O).is_some());
        doc.undo().unwrap();
        assert_eq!(doc.store.get(O).unwrap().style.fill, None);
    }

    #[test]
    fn test_remote_edit_after_own_edit_is_kept_on_undo_regardless_of_site_order() {
        let mut doc = Doc::new();
        doc.local(OpKind::Insert { object: rect() });
        doc.local(fill(Color::rgb(9, 9, 9)));
        let id = OpId::new(SiteId(0), 99);
        let op = Operation {
            id,
            base_seq: doc.store.seq(),
            kind: fill(Color::rgb(1, 1, 1)),
        };
        doc.commit(op);
        doc.undo().unwrap();
        assert_eq!(doc.store.get(O).unwrap().style.fill, Some(Color::rgb(1, 1, 1)));
    }

    #[test]
    fn test_unacknowledged_entry_cannot_be_undone() {
        let mut history = HistoryManager::new(SITE, 10);
        let op = Operation {
            id: OpId::new(SITE, 1),
            base_seq: 0,
            kind: OpKind::Insert { object: rect() },
        };
        history.record(&op);
        let log = CommitLog::new(8);
        assert_eq!(
            history.prepare_undo(&log, &DocumentStore::new(), OpId::new(SITE, 2), 0),
            Err(HistoryError::Unacknowledged(1))
        );
    }

    #[test]
    fn test_truncated_log_reported() {
        let mut doc = Doc::new();
        doc.log = CommitLog::new(2);
        doc.local(OpKind::Insert { object: rect() });
        for i in 0..4 {
            doc.remote(OpKind::Reorder { target: O, layer_order: i });
        }
        assert_eq!(doc.undo(), Err(HistoryError::HistoryTruncated(1)));
    }

    #[test]
    fn test_new_gesture_invalidates_redo() {
        let mut doc = Doc::new();
        doc.local(OpKind::Insert { object: rect() });
        doc.undo().unwrap();
        assert!(doc.history.can_redo());
        doc.local(OpKind::Insert {
            object: CanvasObject::rectangle(ObjectId::from_u128(11), SITE, 0.0, 0.0, 1.0, 1.0),
        });
        assert!(!doc.history.can_redo());
        assert!(doc.history.retired().any(|e| e.state == EntryState::Invalidated));
    }

    #[test]
    fn test_history_cap_drops_oldest() {
        let mut doc = Doc::new();
        doc.history = HistoryManager::new(SITE, 2);
        doc.local(OpKind::Insert { object: rect() });
        for i in 0..3 {
            doc.local(OpKind::Reorder { target: O, layer_order: i + 1 });
        }
        assert_eq!(doc.history.undo_depth(), 2);
        doc.undo().unwrap();
        doc.undo().unwrap();
        assert_eq!(doc.undo(), Err(HistoryError::NothingToUndo));
        assert_eq!(doc.store.get(O).unwrap().layer_order, 1);
    }

    #[test]
    fn test_rejected_gesture_op_is_forgotten() {
        let mut history = HistoryManager::new(SITE, 10);
        let op = Operation {
            id: OpId::new(SITE, 1),
            base_seq: 0,
            kind: OpKind::Insert { object: rect() },
        };
        history.record(&op);
        history.rejected(op.id);
        assert!(!history.can_undo());
    }
}

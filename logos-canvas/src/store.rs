//! In-memory document store.
//!
//! Objects live in an arena (`Vec<Slot>`) indexed by [`ObjectId`]. Deleted
//! objects are tombstoned rather than removed so that late concurrent edits
//! targeting them degrade to no-ops instead of errors.
//!
//! The authoritative state of a document is a fold of [`CommitRecord`]s over
//! the empty store; `apply` enforces that records arrive contiguously.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::{CanvasObject, Field, ObjectId, ShapeKind};
use crate::operation::{CommitRecord, OpKind};

/// Creation sequence used for optimistic, not-yet-committed inserts.
/// Sorts above every committed object in the same layer.
pub const UNCOMMITTED_SEQ: u64 = u64::MAX;

/// Change notification for the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectDelta {
    Created(ObjectId),
    Updated { id: ObjectId, fields: Vec<Field> },
    Deleted(ObjectId),
    Reordered { id: ObjectId, layer_order: i64 },
}

/// Store errors.
///
/// `StaleTarget` is only produced by [`DocumentStore::check_live`]; while
/// applying commits, tombstoned targets are absorbed as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("Out-of-order commit: expected seq {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("Unknown target object: {0}")]
    UnknownTarget(ObjectId),

    #[error("Object already exists: {0}")]
    DuplicateObject(ObjectId),

    #[error("Target object is deleted: {0}")]
    StaleTarget(ObjectId),

    #[error("Object {0} is not a group and cannot hold children")]
    NotAGroup(ObjectId),
}

/// Live objects at a given sequence number, in paint order.
///
/// Tombstones travel along so that commits still targeting them apply as
/// no-ops on an imported store, and `created` carries the creation order of
/// `objects` followed by `tombstones` so imported paint order matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub objects: Vec<CanvasObject>,
    pub tombstones: Vec<CanvasObject>,
    pub created: Vec<u64>,
}

impl Snapshot {
    /// Snapshot of live objects only; creation order follows `objects`.
    pub fn live(seq: u64, objects: Vec<CanvasObject>) -> Self {
        Self {
            seq,
            objects,
            tombstones: Vec::new(),
            created: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    object: CanvasObject,
    /// Sequence number of the commit that created the object; breaks ties
    /// between equal layer orders.
    created_seq: u64,
    tombstone: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    slots: Vec<Slot>,
    index: FxHashMap<ObjectId, usize>,
    seq: u64,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a snapshot without replaying history.
    pub fn import_snapshot(seq: u64, objects: Vec<CanvasObject>) -> Self {
        let mut store = Self {
            seq,
            ..Self::default()
        };
        for (position, object) in objects.into_iter().enumerate() {
            store.index.insert(object.id, store.slots.len());
            store.slots.push(Slot {
                object,
                created_seq: position as u64,
                tombstone: false,
            });
        }
        store
    }

    /// Seed a store from an exported snapshot, tombstones included.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let Snapshot {
            seq,
            objects,
            tombstones,
            created,
        } = snapshot;
        let live = objects.len();
        let mut store = Self::import_snapshot(seq, objects);
        for object in tombstones {
            store.index.insert(object.id, store.slots.len());
            store.slots.push(Slot {
                object,
                created_seq: 0,
                tombstone: true,
            });
        }
        if created.len() == store.slots.len() {
            for (slot, created_seq) in store.slots.iter_mut().zip(created) {
                slot.created_seq = created_seq;
            }
        } else {
            for (position, slot) in store.slots.iter_mut().enumerate().skip(live) {
                slot.created_seq = position as u64;
            }
        }
        store
    }

    pub fn export_snapshot(&self) -> Snapshot {
        let mut live: Vec<&Slot> = self.slots.iter().filter(|s| !s.tombstone).collect();
        live.sort_by(|a, b| paint_key(a).cmp(&paint_key(b)));
        let mut tombstones: Vec<&Slot> = self.slots.iter().filter(|s| s.tombstone).collect();
        tombstones.sort_by_key(|s| s.object.id);

        let created = live.iter().chain(tombstones.iter()).map(|s| s.created_seq).collect();
        Snapshot {
            seq: self.seq,
            objects: live.into_iter().map(|s| s.object.clone()).collect(),
            tombstones: tombstones.into_iter().map(|s| s.object.clone()).collect(),
            created,
        }
    }

    /// Sequence number of the last applied commit.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| !s.tombstone).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply the next commit in sequence.
    pub fn apply(&mut self, record: &CommitRecord) -> Result<Vec<ObjectDelta>, ApplyError> {
        if record.seq != self.seq + 1 {
            return Err(ApplyError::OutOfOrder {
                expected: self.seq + 1,
                got: record.seq,
            });
        }
        self.check(&record.op.kind)?;
        let deltas = self.apply_kind(&record.op.kind, record.seq);
        self.seq = record.seq;
        Ok(deltas)
    }

    /// Apply an operation that has already been ordered at `seq` by the
    /// sequencer but was rewritten locally (client-side rebase).
    pub fn apply_rebased(&mut self, kind: &OpKind, seq: u64) -> Result<Vec<ObjectDelta>, ApplyError> {
        self.check(kind)?;
        let deltas = self.apply_kind(kind, seq);
        self.seq = self.seq.max(seq);
        Ok(deltas)
    }

    /// Optimistically apply a local, uncommitted operation.
    pub fn apply_pending(&mut self, kind: &OpKind) -> Result<Vec<ObjectDelta>, ApplyError> {
        self.check(kind)?;
        Ok(self.apply_kind(kind, UNCOMMITTED_SEQ))
    }

    /// Validate that `kind` can be applied: targets must exist (live or
    /// tombstoned) and inserts must not collide with a live object.
    pub fn check(&self, kind: &OpKind) -> Result<(), ApplyError> {
        self.check_kind(kind, false, &mut FxHashMap::default(), &mut FxHashSet::default())
    }

    /// Like [`check`](Self::check), but tombstoned targets are reported as
    /// [`ApplyError::StaleTarget`]. Used before creating a local edit.
    pub fn check_live(&self, kind: &OpKind) -> Result<(), ApplyError> {
        self.check_kind(kind, true, &mut FxHashMap::default(), &mut FxHashSet::default())
    }

    fn check_kind(
        &self,
        kind: &OpKind,
        strict: bool,
        inserted: &mut FxHashMap<ObjectId, ShapeKind>,
        deleted: &mut FxHashSet<ObjectId>,
    ) -> Result<(), ApplyError> {
        match kind {
            OpKind::Insert { object } => {
                let id = object.id;
                let live = inserted.contains_key(&id) || (self.is_live(id) && !deleted.contains(&id));
                if live {
                    return Err(ApplyError::DuplicateObject(id));
                }
                inserted.insert(id, object.kind);
                deleted.remove(&id);
            }
            OpKind::Update { target, .. } | OpKind::Reorder { target, .. } | OpKind::Delete { target } => {
                if !inserted.contains_key(target) {
                    if !self.contains(*target) {
                        return Err(ApplyError::UnknownTarget(*target));
                    }
                    if strict && (!self.is_live(*target) || deleted.contains(target)) {
                        return Err(ApplyError::StaleTarget(*target));
                    }
                }
                if let OpKind::Update { target, patch } = kind {
                    // Children only belong on groups; inserts enforce the same in `validate`.
                    let target_kind = inserted
                        .get(target)
                        .copied()
                        .or_else(|| self.slot(*target).map(|s| s.object.kind));
                    if patch.contains(Field::Children) && target_kind != Some(ShapeKind::Group) {
                        return Err(ApplyError::NotAGroup(*target));
                    }
                }
                if let OpKind::Delete { target } = kind {
                    inserted.remove(target);
                    deleted.insert(*target);
                }
            }
            OpKind::Group { ops } => {
                for op in ops {
                    self.check_kind(op, strict, inserted, deleted)?;
                }
            }
            OpKind::Noop { .. } => {}
        }
        Ok(())
    }

    fn apply_kind(&mut self, kind: &OpKind, seq: u64) -> Vec<ObjectDelta> {
        let mut deltas = Vec::new();
        self.apply_into(kind, seq, &mut deltas);
        deltas
    }

    fn apply_into(&mut self, kind: &OpKind, seq: u64, deltas: &mut Vec<ObjectDelta>) {
        match kind {
            OpKind::Insert { object } => self.insert(object, seq, deltas),
            OpKind::Update { target, patch } => {
                let Some(slot) = self.slot_mut(*target) else {
                    log::warn!("Update on unknown object {target} ignored");
                    return;
                };
                slot.object.version += 1;
                if slot.tombstone {
                    log::trace!("Update on deleted object {target} absorbed as no-op");
                    return;
                }
                let fields = patch
                    .iter()
                    .filter(|(field, value)| slot.object.write(*field, value))
                    .map(|(field, _)| field)
                    .collect();
                deltas.push(ObjectDelta::Updated { id: *target, fields });
            }
            OpKind::Delete { target } => {
                let Some(slot) = self.slot_mut(*target) else {
                    log::warn!("Delete on unknown object {target} ignored");
                    return;
                };
                slot.object.version += 1;
                if slot.tombstone {
                    log::trace!("Delete on deleted object {target} absorbed as no-op");
                    return;
                }
                slot.tombstone = true;
                deltas.push(ObjectDelta::Deleted(*target));
            }
            OpKind::Reorder { target, layer_order } => {
                let Some(slot) = self.slot_mut(*target) else {
                    log::warn!("Reorder on unknown object {target} ignored");
                    return;
                };
                slot.object.version += 1;
                if slot.tombstone {
                    return;
                }
                slot.object.layer_order = *layer_order;
                deltas.push(ObjectDelta::Reordered {
                    id: *target,
                    layer_order: *layer_order,
                });
            }
            OpKind::Group { ops } => {
                for op in ops {
                    self.apply_into(op, seq, deltas);
                }
            }
            OpKind::Noop { target, .. } => {
                if let Some(slot) = target.and_then(|id| self.slot_mut(id)) {
                    slot.object.version += 1;
                }
            }
        }
    }

    fn insert(&mut self, object: &CanvasObject, seq: u64, deltas: &mut Vec<ObjectDelta>) {
        let mut object = object.clone();
        match self.index.get(&object.id) {
            Some(&idx) => {
                let slot = &mut self.slots[idx];
                object.version = slot.object.version + 1;
                if slot.tombstone {
                    deltas.push(ObjectDelta::Created(object.id));
                } else {
                    log::warn!("Insert over live object {} treated as overwrite", object.id);
                    deltas.push(ObjectDelta::Updated {
                        id: object.id,
                        fields: slot.object.diff(&object),
                    });
                }
                slot.object = object;
                slot.tombstone = false;
            }
            None => {
                object.version = 1;
                let id = object.id;
                self.index.insert(id, self.slots.len());
                self.slots.push(Slot {
                    object,
                    created_seq: seq,
                    tombstone: false,
                });
                deltas.push(ObjectDelta::Created(id));
            }
        }
    }

    fn slot(&self, id: ObjectId) -> Option<&Slot> {
        self.index.get(&id).map(|&idx| &self.slots[idx])
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        match self.index.get(&id) {
            Some(&idx) => Some(&mut self.slots[idx]),
            None => None,
        }
    }

    fn remove_slot(&mut self, id: ObjectId) -> Option<Slot> {
        let idx = self.index.remove(&id)?;
        let slot = self.slots.swap_remove(idx);
        if let Some(moved) = self.slots.get(idx) {
            self.index.insert(moved.object.id, idx);
        }
        Some(slot)
    }

    /// Live object by id.
    pub fn get(&self, id: ObjectId) -> Option<&CanvasObject> {
        self.slot(id).filter(|s| !s.tombstone).map(|s| &s.object)
    }

    /// Tombstoned object by id.
    pub fn tombstone(&self, id: ObjectId) -> Option<&CanvasObject> {
        self.slot(id).filter(|s| s.tombstone).map(|s| &s.object)
    }

    /// Whether the store has ever seen `id` (live or tombstoned).
    pub fn contains(&self, id: ObjectId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Recorded version of an object, tombstones included.
    pub fn version(&self, id: ObjectId) -> Option<u64> {
        self.slot(id).map(|s| s.object.version)
    }

    /// Live objects in paint order: `(layer_order, creating commit, id)`.
    pub fn snapshot(&self) -> Vec<CanvasObject> {
        let mut live: Vec<&Slot> = self.slots.iter().filter(|s| !s.tombstone).collect();
        live.sort_by(|a, b| paint_key(a).cmp(&paint_key(b)));
        live.into_iter().map(|s| s.object.clone()).collect()
    }

    /// Live objects sorted by id; order-independent view for comparisons.
    pub fn live_by_id(&self) -> Vec<CanvasObject> {
        let mut live: Vec<CanvasObject> = self
            .slots
            .iter()
            .filter(|s| !s.tombstone)
            .map(|s| s.object.clone())
            .collect();
        live.sort_by_key(|o| o.id);
        live
    }

    /// `(id, version, tombstoned)` for every known object, sorted by id.
    pub fn versions(&self) -> Vec<(ObjectId, u64, bool)> {
        let mut versions: Vec<_> = self
            .slots
            .iter()
            .map(|s| (s.object.id, s.object.version, s.tombstone))
            .collect();
        versions.sort_by_key(|v| v.0);
        versions
    }

    /// Every known id, tombstones included.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.slots.iter().map(|s| s.object.id)
    }

    /// Small store holding copies of the given objects (for simulating
    /// multi-step edits without cloning the whole document).
    pub fn scratch(&self, ids: impl IntoIterator<Item = ObjectId>) -> DocumentStore {
        let mut scratch = DocumentStore {
            seq: self.seq,
            ..DocumentStore::default()
        };
        for id in ids {
            if scratch.contains(id) {
                continue;
            }
            if let Some(slot) = self.slot(id) {
                scratch.index.insert(id, scratch.slots.len());
                scratch.slots.push(slot.clone());
            }
        }
        scratch
    }

    /// Make the given objects identical to their state in `other`, returning
    /// the deltas a renderer needs to observe the change.
    pub fn resync_from(
        &mut self,
        other: &DocumentStore,
        ids: impl IntoIterator<Item = ObjectId>,
    ) -> Vec<ObjectDelta> {
        let mut deltas = Vec::new();
        let mut seen = FxHashSet::default();
        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            let before = self.get(id).cloned();
            match other.slot(id) {
                Some(theirs) => match self.index.get(&id) {
                    Some(&idx) => self.slots[idx] = theirs.clone(),
                    None => {
                        self.index.insert(id, self.slots.len());
                        self.slots.push(theirs.clone());
                    }
                },
                None => {
                    self.remove_slot(id);
                }
            }
            diff_into(before.as_ref(), self.get(id), &mut deltas);
        }
        self.seq = other.seq;
        deltas
    }
}

fn paint_key(slot: &Slot) -> (i64, u64, ObjectId) {
    (slot.object.layer_order, slot.created_seq, slot.object.id)
}

fn diff_into(before: Option<&CanvasObject>, after: Option<&CanvasObject>, deltas: &mut Vec<ObjectDelta>) {
    match (before, after) {
        (None, Some(after)) => deltas.push(ObjectDelta::Created(after.id)),
        (Some(before), None) => deltas.push(ObjectDelta::Deleted(before.id)),
        (Some(before), Some(after)) => {
            let fields = before.diff(after);
            if !fields.is_empty() {
                deltas.push(ObjectDelta::Updated { id: after.id, fields });
            }
            if before.layer_order != after.layer_order {
                deltas.push(ObjectDelta::Reordered {
                    id: after.id,
                    layer_order: after.layer_order,
                });
            }
        }
        (None, None) => {}
    }
}

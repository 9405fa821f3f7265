//! Transform engine.
//!
//! `transform(a, b)` rewrites `b` so it can be applied after `a`, where `a`
//! and `b` were both produced against the same document state. The table
//! below is exhaustive over [`OpKind`] pairs; adding a kind fails to compile
//! until it is handled here.
//!
//! ```text
//!  committed ↓ / concurrent →  Insert   Update        Delete   Reorder
//!  Insert                      ≠id: b   same id: ∅    b        same id: ∅
//!  Update                      b        tie-break     b        b
//!  Delete                      same: ∅  same: ∅       same: ∅  same: ∅
//!  Reorder                     b        b             b        tie-break
//!
//!  ∅ = no-op variant of b    b = unchanged    Group/Noop handled structurally
//! ```
//!
//! Same-field conflicts are resolved in favour of the larger [`OpId`].

use thiserror::Error;

use crate::object::ObjectId;
use crate::operation::{CommitRecord, OpId, OpKind, OpTag, Operation};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// An operation pair the engine cannot reconcile. Fatal for the
    /// document's sequencer.
    #[error("Unsupported transform of {concurrent:?} against {committed:?}: {reason}")]
    Unsupported {
        committed: OpTag,
        concurrent: OpTag,
        reason: String,
    },

    /// Two concurrent inserts claim the same object id. The later one is a
    /// client error, not an engine gap.
    #[error("Object {id} is inserted by a concurrent operation")]
    IdCollision { id: ObjectId },
}

impl TransformError {
    /// Whether the engine itself failed, as opposed to the concurrent
    /// operation being invalid.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransformError::Unsupported { .. })
    }
}

/// Rewrite `concurrent` so it applies after `committed`.
///
/// The result keeps `concurrent`'s id and base sequence.
pub fn transform(committed: &Operation, concurrent: &Operation) -> Result<Operation, TransformError> {
    let kind = transform_kind(&committed.kind, committed.id, &concurrent.kind, concurrent.id)?;
    Ok(concurrent.with_kind(kind))
}

/// Fold `transform` over a suffix of committed records, in commit order.
pub fn rebase<'a>(
    op: &Operation,
    committed: impl IntoIterator<Item = &'a CommitRecord>,
) -> Result<Operation, TransformError> {
    let mut rebased = op.clone();
    let mut steps = 0usize;
    for record in committed {
        rebased = transform(&record.op, &rebased)?;
        steps += 1;
    }
    log::trace!("Rebased {} over {} commits", op.id, steps);
    Ok(rebased)
}

/// Kind-level transform. `a` is applied first; the returned kind is `b`
/// rewritten for the state after `a`.
pub fn transform_kind(a: &OpKind, a_id: OpId, b: &OpKind, b_id: OpId) -> Result<OpKind, TransformError> {
    use OpKind::*;

    match (a, b) {
        // A committed group is a sequence: rebase `b` over each member.
        (Group { ops }, _) => {
            let mut rebased = b.clone();
            for sub in ops {
                reject_nested(sub, a, b)?;
                rebased = transform_kind(sub, a_id, &rebased, b_id)?;
            }
            Ok(rebased)
        }
        // A concurrent group: each member sees `a` as rewritten by the
        // members before it.
        (_, Group { ops }) => {
            let mut current = a.clone();
            let mut rewritten = Vec::with_capacity(ops.len());
            for sub in ops {
                reject_nested(sub, a, b)?;
                rewritten.push(transform_kind(&current, a_id, sub, b_id)?);
                current = transform_kind(sub, b_id, &current, a_id)?;
            }
            Ok(Group { ops: rewritten })
        }

        (Noop { .. }, _) | (_, Noop { .. }) => Ok(b.clone()),

        (Insert { object: x }, Insert { object: y }) => {
            if x.id == y.id {
                return Err(TransformError::IdCollision { id: x.id });
            }
            Ok(b.clone())
        }
        // `b` was created while its target was tombstoned; `a` resurrects it
        // with fresh contents.
        (Insert { object }, Update { target, .. } | Reorder { target, .. }) if object.id == *target => {
            Ok(b.to_noop())
        }
        (Insert { .. }, _) => Ok(b.clone()),

        (Delete { target }, Insert { object }) if object.id == *target => Ok(b.to_noop()),
        (_, Insert { .. }) => Ok(b.clone()),

        (Delete { target: gone }, Update { target, .. } | Delete { target } | Reorder { target, .. })
            if gone == target =>
        {
            Ok(b.to_noop())
        }
        (Delete { .. }, _) => Ok(b.clone()),

        (Update { .. } | Reorder { .. }, Delete { .. }) => Ok(b.clone()),

        (Update { target: ta, patch: pa }, Update { target: tb, patch: pb }) => {
            if ta != tb || a_id < b_id {
                return Ok(b.clone());
            }
            let mut patch = pb.clone();
            patch.retain(|field| !pa.contains(field));
            if patch.is_empty() {
                Ok(b.to_noop())
            } else {
                Ok(Update { target: *tb, patch })
            }
        }
        (Update { .. }, Reorder { .. }) | (Reorder { .. }, Update { .. }) => Ok(b.clone()),

        (Reorder { target: ta, .. }, Reorder { target: tb, .. }) => {
            if ta == tb && a_id > b_id {
                Ok(b.to_noop())
            } else {
                Ok(b.clone())
            }
        }
    }
}

fn reject_nested(sub: &OpKind, a: &OpKind, b: &OpKind) -> Result<(), TransformError> {
    if let OpKind::Group { .. } = sub {
        return Err(TransformError::Unsupported {
            committed: a.tag(),
            concurrent: b.tag(),
            reason: "nested group operation".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{CanvasObject, Color, Field, FieldPatch, FieldValue, ObjectId, SiteId};
    use crate::store::DocumentStore;

    const X: ObjectId = ObjectId::from_u128(1);
    const Y: ObjectId = ObjectId::from_u128(2);
    const FRESH: ObjectId = ObjectId::from_u128(3);

    fn id(site: u64, counter: u64) -> OpId {
        OpId::new(SiteId(site), counter)
    }

    fn op(site: u64, counter: u64, kind: OpKind) -> Operation {
        Operation {
            id: id(site, counter),
            base_seq: 2,
            kind,
        }
    }

    fn insert(target: ObjectId) -> OpKind {
        OpKind::Insert {
            object: CanvasObject::rectangle(target, SiteId(1), 5.0, 5.0, 20.0, 20.0),
        }
    }

    fn update(target: ObjectId, field: Field, value: FieldValue) -> OpKind {
        OpKind::Update {
            target,
            patch: FieldPatch::new().with(field, value),
        }
    }

    fn fill(target: ObjectId, c: Color) -> OpKind {
        update(target, Field::Fill, FieldValue::Color(Some(c)))
    }

    fn width(target: ObjectId, w: f64) -> OpKind {
        update(target, Field::StrokeWidth, FieldValue::Number(w))
    }

    fn delete(target: ObjectId) -> OpKind {
        OpKind::Delete { target }
    }

    fn reorder(target: ObjectId, layer_order: i64) -> OpKind {
        OpKind::Reorder { target, layer_order }
    }

    /// Two live objects `X` and `Y` at seq 2.
    fn base() -> DocumentStore {
        let mut store = DocumentStore::new();
        store.apply_rebased(&insert(X), 1).unwrap();
        store.apply_rebased(&insert(Y), 2).unwrap();
        store
    }

    /// Apply `[a, T(a,b)]` and `[b, T(b,a)]` and assert identical results.
    fn assert_converges(store: &DocumentStore, a: &Operation, b: &Operation) -> DocumentStore {
        let seq = store.seq();
        let mut left = store.clone();
        left.apply_rebased(&a.kind, seq + 1).unwrap();
        left.apply_rebased(&transform(a, b).unwrap().kind, seq + 2).unwrap();

        let mut right = store.clone();
        right.apply_rebased(&b.kind, seq + 1).unwrap();
        right.apply_rebased(&transform(b, a).unwrap().kind, seq + 2).unwrap();

        assert_eq!(left.live_by_id(), right.live_by_id(), "live sets diverged for {a:?} / {b:?}");
        assert_eq!(left.versions(), right.versions(), "versions diverged for {a:?} / {b:?}");
        left
    }

    fn kinds(target: ObjectId) -> Vec<OpKind> {
        vec![
            fill(target, Color::rgb(200, 0, 0)),
            width(target, 3.0),
            delete(target),
            reorder(target, 4),
            OpKind::Noop {
                target: Some(target),
                shadowed: OpTag::Update,
            },
            OpKind::Group {
                ops: vec![fill(target, Color::rgb(0, 9, 0)), reorder(target, -1)],
            },
        ]
    }

    #[test]
    fn test_every_pair_converges_on_same_target() {
        let store = base();
        for a in kinds(X) {
            for b in kinds(X) {
                assert_converges(&store, &op(1, 5, a.clone()), &op(2, 3, b.clone()));
                assert_converges(&store, &op(2, 3, a.clone()), &op(1, 5, b.clone()));
            }
        }
    }

    #[test]
    fn test_every_pair_converges_on_distinct_targets() {
        let store = base();
        for a in kinds(X) {
            for b in kinds(Y) {
                assert_converges(&store, &op(1, 5, a.clone()), &op(2, 3, b.clone()));
            }
        }
    }

    #[test]
    fn test_insert_is_independent() {
        let store = base();
        for other in kinds(X) {
            let ins = op(1, 9, insert(FRESH));
            let b = op(2, 1, other.clone());
            assert_eq!(transform(&b, &ins).unwrap(), ins);
            assert_eq!(transform(&ins, &b).unwrap(), b);
            let merged = assert_converges(&store, &ins, &b);
            assert!(merged.get(FRESH).is_some());
        }
    }

    #[test]
    fn test_concurrent_inserts_of_distinct_ids_both_survive() {
        let a = op(1, 1, insert(FRESH));
        let b = op(2, 1, insert(ObjectId::from_u128(4)));
        let merged = assert_converges(&base(), &a, &b);
        assert_eq!(merged.len(), 4);
    }

    #[test]
    fn test_delete_dominates_every_kind() {
        let del = op(1, 1, delete(X));
        for other in kinds(X) {
            let b = op(2, 1, other);
            assert!(transform(&del, &b).unwrap().is_noop(), "{b:?} survived a delete");
        }
        let b = op(2, 1, fill(X, Color::BLACK));
        assert_eq!(transform(&b, &del).unwrap(), del);
    }

    #[test]
    fn test_delete_yields_noop_with_target_and_shadowed_kind() {
        let del = op(1, 1, delete(X));
        let upd = op(2, 1, fill(X, Color::BLACK));
        assert_eq!(
            transform(&del, &upd).unwrap().kind,
            OpKind::Noop {
                target: Some(X),
                shadowed: OpTag::Update
            }
        );
    }

    #[test]
    fn test_same_field_larger_op_id_wins() {
        let red = op(1, 5, fill(X, Color::rgb(255, 0, 0)));
        let blue = op(2, 3, fill(X, Color::rgb(0, 0, 255)));
        assert_eq!(transform(&red, &blue).unwrap(), blue);
        assert!(transform(&blue, &red).unwrap().is_noop());
        let merged = assert_converges(&base(), &red, &blue);
        assert_eq!(merged.get(X).unwrap().style.fill, Some(Color::rgb(0, 0, 255)));
    }

    #[test]
    fn test_overlapping_patch_keeps_disjoint_fields() {
        let a = op(9, 1, fill(X, Color::rgb(1, 1, 1)));
        let both = OpKind::Update {
            target: X,
            patch: FieldPatch::new()
                .with(Field::Fill, FieldValue::Color(Some(Color::rgb(2, 2, 2))))
                .with(Field::Opacity, FieldValue::Number(0.5)),
        };
        let b = op(1, 1, both);
        match transform(&a, &b).unwrap().kind {
            OpKind::Update { patch, .. } => {
                assert!(!patch.contains(Field::Fill));
                assert!(patch.contains(Field::Opacity));
            }
            other => panic!("expected update, got {other:?}"),
        }
        let merged = assert_converges(&base(), &a, &b);
        let object = merged.get(X).unwrap();
        assert_eq!(object.style.fill, Some(Color::rgb(1, 1, 1)));
        assert_eq!(object.style.opacity, 0.5);
    }

    #[test]
    fn test_disjoint_fields_both_survive() {
        let a = op(1, 1, fill(X, Color::rgb(10, 20, 30)));
        let b = op(2, 1, width(X, 6.0));
        let merged = assert_converges(&base(), &a, &b);
        let object = merged.get(X).unwrap();
        assert_eq!(object.style.fill, Some(Color::rgb(10, 20, 30)));
        assert_eq!(object.style.stroke_width, 6.0);
    }

    #[test]
    fn test_reorder_tie_break() {
        let low = op(1, 1, reorder(X, 7));
        let high = op(3, 1, reorder(X, -2));
        assert!(transform(&high, &low).unwrap().is_noop());
        assert_eq!(transform(&low, &high).unwrap(), high);
        let merged = assert_converges(&base(), &low, &high);
        assert_eq!(merged.get(X).unwrap().layer_order, -2);
    }

    #[test]
    fn test_reorder_and_update_pass_through() {
        let r = op(1, 1, reorder(X, 3));
        let u = op(2, 1, width(X, 2.0));
        assert_eq!(transform(&r, &u).unwrap(), u);
        assert_eq!(transform(&u, &r).unwrap(), r);
    }

    #[test]
    fn test_resurrecting_insert_loses_to_delete() {
        let mut store = base();
        store.apply_rebased(&delete(X), 3).unwrap();
        let revive = op(1, 4, insert(X));
        let del = op(2, 4, delete(X));
        assert!(transform(&del, &revive).unwrap().is_noop());
        assert_eq!(transform(&revive, &del).unwrap(), del);
        let merged = assert_converges(&store, &revive, &del);
        assert!(merged.get(X).is_none());
    }

    #[test]
    fn test_resurrecting_insert_neutralises_edit_of_tombstone() {
        let mut store = base();
        store.apply_rebased(&delete(X), 3).unwrap();
        let revive = op(1, 4, insert(X));
        let stale = op(2, 4, fill(X, Color::rgb(3, 3, 3)));
        assert!(transform(&revive, &stale).unwrap().is_noop());
        let merged = assert_converges(&store, &revive, &stale);
        assert_eq!(merged.get(X).unwrap().style.fill, None);
    }

    #[test]
    fn test_duplicate_insert_is_id_collision() {
        let a = op(1, 1, insert(FRESH));
        let b = op(2, 1, insert(FRESH));
        let err = transform(&a, &b).unwrap_err();
        assert_eq!(err, TransformError::IdCollision { id: FRESH });
        assert!(!err.is_fatal());

        let grouped = op(2, 1, OpKind::Group { ops: vec![delete(Y), insert(FRESH)] });
        assert_eq!(transform(&a, &grouped).unwrap_err(), TransformError::IdCollision { id: FRESH });
    }

    #[test]
    fn test_nested_group_is_unsupported() {
        let nested = op(
            1,
            1,
            OpKind::Group {
                ops: vec![OpKind::Group { ops: vec![delete(X)] }],
            },
        );
        let b = op(2, 1, delete(Y));
        assert!(transform(&nested, &b).is_err());
        assert!(transform(&b, &nested).is_err());
    }

    #[test]
    fn test_group_against_group_keeps_arity() {
        let a = op(1, 1, OpKind::Group { ops: vec![delete(X), width(Y, 1.5)] });
        let b = op(2, 1, OpKind::Group { ops: vec![fill(X, Color::BLACK), width(Y, 9.0)] });
        match transform(&a, &b).unwrap().kind {
            OpKind::Group { ops } => {
                assert_eq!(ops.len(), 2);
                assert!(ops[0].is_noop());
                assert!(!ops[1].is_noop());
            }
            other => panic!("expected group, got {other:?}"),
        }
        let merged = assert_converges(&base(), &a, &b);
        assert_eq!(merged.get(Y).unwrap().style.stroke_width, 9.0);
    }

    #[test]
    fn test_transform_preserves_identity() {
        let a = op(1, 1, delete(X));
        let b = op(2, 7, fill(X, Color::BLACK));
        let rewritten = transform(&a, &b).unwrap();
        assert_eq!(rewritten.id, b.id);
        assert_eq!(rewritten.base_seq, b.base_seq);
    }

    #[test]
    fn test_rebase_folds_in_commit_order() {
        let records: Vec<CommitRecord> = [op(1, 1, width(X, 2.0)), op(3, 1, delete(X))]
            .into_iter()
            .enumerate()
            .map(|(i, op)| CommitRecord {
                seq: 3 + i as u64,
                op,
                committed_at: 3 + i as u64,
            })
            .collect();
        let pending = op(2, 1, width(X, 8.0));
        let rebased = rebase(&pending, &records).unwrap();
        assert!(rebased.is_noop());
        assert_eq!(rebase(&pending, &[]).unwrap(), pending);
    }
}

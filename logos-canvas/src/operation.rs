//! Operation model.
//!
//! An [`Operation`] is an immutable description of one edit intent. The
//! transform engine never mutates an operation; it produces a new value with
//! the same [`OpId`] and a rewritten [`OpKind`].
//!
//! Wire format (bincode-encoded, `config::standard()`):
//! ```text
//! ┌──────────────┬───────────┬──────────────────────────┐
//! │ op_id        │ base_seq  │ kind (tagged payload)    │
//! │ site+counter │ varint    │ variable                 │
//! └──────────────┴───────────┴──────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object::{CanvasObject, FieldPatch, ObjectId, SiteId};

/// Globally unique operation identifier, totally ordered per site.
///
/// Ordering is lexicographic on `(site, counter)`; this order is the
/// tie-break for concurrent writes to the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub site: SiteId,
    pub counter: u64,
}

impl OpId {
    pub const fn new(site: SiteId, counter: u64) -> Self {
        Self { site, counter }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.site.0, self.counter)
    }
}

/// Kind discriminant, used in diagnostics and in no-op variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpTag {
    Insert,
    Update,
    Delete,
    Reorder,
    Group,
    Noop,
}

/// Kind-specific payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Create an object with a fresh id. Inserting an id that is currently
    /// tombstoned resurrects it (undo of a delete).
    Insert { object: CanvasObject },
    /// Overwrite the fields present in `patch`.
    Update { target: ObjectId, patch: FieldPatch },
    Delete { target: ObjectId },
    Reorder { target: ObjectId, layer_order: i64 },
    /// Sub-operations applied atomically, in order. Groups do not nest.
    Group { ops: Vec<OpKind> },
    /// An operation neutralised by a concurrent edit. Still advances the
    /// target's version when committed.
    Noop { target: Option<ObjectId>, shadowed: OpTag },
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            OpKind::Insert { .. } => OpTag::Insert,
            OpKind::Update { .. } => OpTag::Update,
            OpKind::Delete { .. } => OpTag::Delete,
            OpKind::Reorder { .. } => OpTag::Reorder,
            OpKind::Group { .. } => OpTag::Group,
            OpKind::Noop { .. } => OpTag::Noop,
        }
    }

    /// Existing object this operation refers to. `None` for inserts and groups.
    pub fn target(&self) -> Option<ObjectId> {
        match self {
            OpKind::Update { target, .. }
            | OpKind::Delete { target }
            | OpKind::Reorder { target, .. } => Some(*target),
            OpKind::Noop { target, .. } => *target,
            OpKind::Insert { .. } | OpKind::Group { .. } => None,
        }
    }

    /// Every object id the operation touches, inserts and group members included.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, out: &mut Vec<ObjectId>) {
        match self {
            OpKind::Insert { object } => out.push(object.id),
            OpKind::Group { ops } => ops.iter().for_each(|op| op.collect_ids(out)),
            other => out.extend(other.target()),
        }
    }

    /// `true` when applying the operation changes nothing but versions.
    pub fn is_noop(&self) -> bool {
        match self {
            OpKind::Noop { .. } => true,
            OpKind::Group { ops } => ops.iter().all(OpKind::is_noop),
            _ => false,
        }
    }

    /// The no-op variant of this operation. Groups keep their arity so the
    /// number of version bumps is preserved.
    pub fn to_noop(&self) -> OpKind {
        match self {
            OpKind::Group { ops } => OpKind::Group {
                ops: ops.iter().map(OpKind::to_noop).collect(),
            },
            OpKind::Insert { object } => OpKind::Noop {
                target: Some(object.id),
                shadowed: OpTag::Insert,
            },
            OpKind::Noop { .. } => self.clone(),
            other => OpKind::Noop {
                target: other.target(),
                shadowed: other.tag(),
            },
        }
    }

    /// Schema validation.
    pub fn validate(&self) -> Result<(), String> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), String> {
        match self {
            OpKind::Insert { object } => object.validate(),
            OpKind::Update { patch, .. } => {
                if patch.is_empty() {
                    return Err("update with an empty patch".to_string());
                }
                for (field, value) in patch.iter() {
                    field.check(value)?;
                }
                Ok(())
            }
            OpKind::Delete { .. } | OpKind::Reorder { .. } | OpKind::Noop { .. } => Ok(()),
            OpKind::Group { ops } => {
                if depth > 0 {
                    return Err("nested group operation".to_string());
                }
                if ops.is_empty() {
                    return Err("group with no sub-operations".to_string());
                }
                ops.iter().try_for_each(|op| op.validate_at(depth + 1))
            }
        }
    }
}

/// Operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("Malformed operation {op_id}: {reason}")]
    Malformed { op_id: OpId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// One edit, tagged with the last server sequence number its author had seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub base_seq: u64,
    pub kind: OpKind,
}

impl Operation {
    /// Build a validated operation.
    pub fn new(id: OpId, base_seq: u64, kind: OpKind) -> Result<Self, OperationError> {
        kind.validate()
            .map_err(|reason| OperationError::Malformed { op_id: id, reason })?;
        Ok(Self { id, base_seq, kind })
    }

    /// Insert `object`, stamping the author as its owner.
    pub fn insert(id: OpId, base_seq: u64, mut object: CanvasObject) -> Result<Self, OperationError> {
        object.owner_site = id.site;
        object.version = 0;
        Self::new(id, base_seq, OpKind::Insert { object })
    }

    pub fn update(id: OpId, base_seq: u64, target: ObjectId, patch: FieldPatch) -> Result<Self, OperationError> {
        Self::new(id, base_seq, OpKind::Update { target, patch })
    }

    pub fn delete(id: OpId, base_seq: u64, target: ObjectId) -> Result<Self, OperationError> {
        Self::new(id, base_seq, OpKind::Delete { target })
    }

    pub fn reorder(id: OpId, base_seq: u64, target: ObjectId, layer_order: i64) -> Result<Self, OperationError> {
        Self::new(id, base_seq, OpKind::Reorder { target, layer_order })
    }

    pub fn group(id: OpId, base_seq: u64, ops: Vec<OpKind>) -> Result<Self, OperationError> {
        Self::new(id, base_seq, OpKind::Group { ops })
    }

    /// Re-run schema validation (e.g. on operations received off the wire).
    pub fn validate(&self) -> Result<(), OperationError> {
        self.kind.validate().map_err(|reason| OperationError::Malformed {
            op_id: self.id,
            reason,
        })
    }

    /// Same identity, different payload. Used by the transform engine.
    pub fn with_kind(&self, kind: OpKind) -> Self {
        Self {
            id: self.id,
            base_seq: self.base_seq,
            kind,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.kind.is_noop()
    }

    /// Serialize to the compact wire form.
    pub fn encode(&self) -> Result<Vec<u8>, OperationError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| OperationError::Serialization(e.to_string()))
    }

    /// Deserialize and validate.
    pub fn decode(bytes: &[u8]) -> Result<Self, OperationError> {
        let (op, _): (Operation, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| OperationError::Deserialization(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }
}

/// A committed operation with its global sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub seq: u64,
    pub op: Operation,
    /// Logical commit timestamp assigned by the sequencer.
    pub committed_at: u64,
}

impl CommitRecord {
    pub fn encode(&self) -> Result<Vec<u8>, OperationError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| OperationError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OperationError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| OperationError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

//! # logos-canvas — Convergent canvas document model for Logos
//!
//! Operation model, document store, transform engine and undo history for
//! the shared canvas. Runtime-free: everything here is synchronous and
//! deterministic; networking lives in `logos-collab`.
//!
//! ## Architecture
//!
//! ```text
//!   user edit ──▶ Operation (op_id, base_seq, kind)
//!                     │
//!                     ▼
//!            ┌─────────────────┐   transform(a, b)   ┌──────────────┐
//!            │ CommitLog       │ ◄──────────────────►│ Transform    │
//!            │ (seq-ordered)   │                     │ Engine       │
//!            └────────┬────────┘                     └──────────────┘
//!                     │ apply(CommitRecord)
//!                     ▼
//!            ┌─────────────────┐   ObjectDelta feed  ┌──────────────┐
//!            │ DocumentStore   │ ───────────────────►│ renderer     │
//!            │ (arena + index) │                     └──────────────┘
//!            └────────┬────────┘
//!                     │ invert
//!                     ▼
//!            ┌─────────────────┐
//!            │ HistoryManager  │
//!            └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`object`] — Canvas objects and field-level patches
//! - [`operation`] — Operations, ids and commit records (bincode wire form)
//! - [`commit_log`] — Bounded window over the committed log
//! - [`store`] — Tombstoning document store, snapshots, deltas
//! - [`transform`] — Pairwise operational transform
//! - [`history`] — Per-site undo/redo

pub mod object;
pub mod operation;
pub mod commit_log;
pub mod store;
pub mod transform;
pub mod history;

// Re-exports for convenience
pub use object::{
    CanvasObject, Color, Field, FieldPatch, FieldValue, Geometry, ObjectId, Point, ShapeKind,
    SiteId, Style,
};
pub use operation::{CommitRecord, OpId, OpKind, OpTag, Operation, OperationError};
pub use commit_log::CommitLog;
pub use store::{ApplyError, DocumentStore, ObjectDelta, Snapshot};
pub use transform::{rebase, transform, transform_kind, TransformError};
pub use history::{invert, EntryState, HistoryEntry, HistoryError, HistoryManager, DEFAULT_MAX_HISTORY};

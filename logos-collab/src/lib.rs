//! # logos-collab — Real-time collaboration layer for Logos
//!
//! Central-sequencer synchronization of canvas documents over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient   │ ◄─────────────────► │ SyncServer   │
//! │ (per user)   │  Submit / Commit    │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ClientSession │                     │ Sequencer    │
//! │ confirmed +  │                     │ (authority,  │
//! │ optimistic   │                     │  per doc)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │ BroadcastSink
//!                                     ┌───────┴───────┐
//!                                     │ BroadcastGroup│
//!                                     │ (fan-out)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Broadcast sink and room fan-out with backpressure
//! - [`sequencer`] — Total commit order, rebase and validation
//! - [`session`] — Client-side optimistic state machine
//! - [`room`] — Per-document sequencer + broadcast group registry
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod protocol;
pub mod broadcast;
pub mod sequencer;
pub mod session;
pub mod room;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{MessageType, PeerInfo, ProtocolError, Rejection, SyncMessage};
pub use broadcast::{BroadcastGroup, BroadcastSink, BroadcastStats, LocalSink};
pub use sequencer::{Sequencer, SequencerConfig, SequencerError, SequencerState};
pub use session::{ClientSession, SessionConfig, SessionError, SessionState};
pub use room::{DocumentRoom, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent};

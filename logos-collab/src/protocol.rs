//! Binary protocol for operation sequencing.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `seq` is the sequence number the message refers to: the base of a
//! submitted operation, the position of a commit, or the sequence a snapshot
//! was taken at. Snapshot payloads are LZ4-compressed (size-prepended).

use logos_canvas::{CommitRecord, OpId, Operation, OperationError, SiteId, Snapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client joins a document room (payload: `PeerInfo`)
    Join = 1,
    /// Client submits an operation (payload: `Operation`)
    Submit = 2,
    /// Sequencer broadcasts a committed operation (payload: `CommitRecord`)
    Commit = 3,
    /// Sequencer refuses an operation, origin only (payload: `Rejection`)
    Reject = 4,
    /// Client asks for a full resync
    SnapshotRequest = 5,
    /// Current document state (payload: LZ4 `Snapshot`)
    Snapshot = 6,
    /// Peer joined notification
    PeerJoined = 7,
    /// Peer left notification
    PeerLeft = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for the peer's avatar
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from peer_id hash
        let hash = peer_id.as_u128();
        let channel = |shift: u32| ((hash >> shift) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [channel(0), channel(8), channel(16), 1.0],
        }
    }

    /// Editing site this peer's operations are stamped with.
    pub fn site(&self) -> SiteId {
        SiteId::from_uuid(&self.peer_id)
    }
}

/// Why the sequencer refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub op_id: OpId,
    pub reason: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    pub seq: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        doc_id: Uuid,
        seq: u64,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            peer_id,
            doc_id,
            seq,
            payload: encode_value(value)?,
        })
    }

    /// Join a document room.
    pub fn join(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Join, info.peer_id, doc_id, 0, info)
    }

    /// Submit an operation for sequencing.
    pub fn submit(peer_id: Uuid, doc_id: Uuid, op: &Operation) -> Result<Self, ProtocolError> {
        let payload = op.encode()?;
        Ok(Self {
            msg_type: MessageType::Submit,
            peer_id,
            doc_id,
            seq: op.base_seq,
            payload,
        })
    }

    /// Committed operation. `origin` is the peer that submitted it.
    pub fn commit(origin: Uuid, doc_id: Uuid, record: &CommitRecord) -> Result<Self, ProtocolError> {
        let payload = record.encode()?;
        Ok(Self {
            msg_type: MessageType::Commit,
            peer_id: origin,
            doc_id,
            seq: record.seq,
            payload,
        })
    }

    pub fn reject(peer_id: Uuid, doc_id: Uuid, rejection: &Rejection) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Reject, peer_id, doc_id, 0, rejection)
    }

    pub fn snapshot_request(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::empty(MessageType::SnapshotRequest, peer_id, doc_id)
    }

    /// Full document state, LZ4-compressed.
    pub fn snapshot(doc_id: Uuid, snapshot: &Snapshot) -> Result<Self, ProtocolError> {
        let raw = encode_value(snapshot)?;
        Ok(Self {
            msg_type: MessageType::Snapshot,
            peer_id: Uuid::nil(),
            doc_id,
            seq: snapshot.seq,
            payload: lz4_flex::compress_prepend_size(&raw),
        })
    }

    /// Create a peer joined notification.
    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::PeerJoined, info.peer_id, doc_id, 0, info)
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::empty(MessageType::PeerLeft, peer_id, doc_id)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, peer_id, Uuid::nil())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, peer_id, Uuid::nil())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_value(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_value(bytes)
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                got: self.msg_type,
            });
        }
        Ok(())
    }

    /// Parse a submitted operation (validated).
    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        self.expect(MessageType::Submit)?;
        Ok(Operation::decode(&self.payload)?)
    }

    pub fn commit_record(&self) -> Result<CommitRecord, ProtocolError> {
        self.expect(MessageType::Commit)?;
        Ok(CommitRecord::decode(&self.payload)?)
    }

    pub fn rejection(&self) -> Result<Rejection, ProtocolError> {
        self.expect(MessageType::Reject)?;
        decode_value(&self.payload)
    }

    pub fn snapshot_payload(&self) -> Result<Snapshot, ProtocolError> {
        self.expect(MessageType::Snapshot)?;
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| ProtocolError::DecompressionError(e.to_string()))?;
        decode_value(&raw)
    }

    /// Parse peer info payload (`Join` or `PeerJoined`).
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            self.expect(MessageType::Join)?;
        }
        decode_value(&self.payload)
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_value<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Decompression error: {0}")]
    DecompressionError(String),

    #[error("Invalid message type: expected {expected:?}, got {got:?}")]
    InvalidMessageType { expected: MessageType, got: MessageType },

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

//! Commit fan-out to every session of a document.
//!
//! The sequencer hands each `CommitRecord` to a [`BroadcastSink`]. The network
//! implementation is [`BroadcastGroup`], a tokio broadcast channel per document
//! room: one encode, O(1) send to all subscribers, and each peer buffers up to
//! `capacity` messages before it lags.
//!
//! Commits go to every subscriber including the origin, which learns its
//! operation's final form and `seq` that way.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use logos_canvas::CommitRecord;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Receives every committed record of one document, in `seq` order.
///
/// Called from inside the sequencer's critical section, so implementations
/// must not block.
pub trait BroadcastSink: Send + Sync {
    fn deliver(&self, record: &CommitRecord);
}

/// In-process sink that queues records for the caller to drain.
///
/// Used when sessions live in the same process as the sequencer.
#[derive(Default)]
pub struct LocalSink {
    queue: Mutex<VecDeque<CommitRecord>>,
}

impl LocalSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every record delivered since the last drain.
    pub fn drain(&self) -> Vec<CommitRecord> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BroadcastSink for LocalSink {
    fn deliver(&self, record: &CommitRecord) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(record.clone()),
            Err(poisoned) => poisoned.into_inner().push_back(record.clone()),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters kept outside the peer lock so the send path never waits.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The broadcast channel of a single document room.
pub struct BroadcastGroup {
    doc_id: Uuid,

    sender: broadcast::Sender<Arc<Vec<u8>>>,

    /// Connected peers in this room
    peers: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a group for `doc_id`. `capacity` bounds how far a slow peer may
    /// fall behind before it starts losing messages.
    pub fn new(doc_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            doc_id,
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    /// Encode once and send to every subscriber.
    ///
    /// Returns the number of receivers the message reached. Filtering the
    /// sender out is the receiving side's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}

impl BroadcastSink for BroadcastGroup {
    fn deliver(&self, record: &CommitRecord) {
        match SyncMessage::commit(Uuid::nil(), self.doc_id, record) {
            Ok(msg) => {
                if let Err(e) = self.broadcast(&msg) {
                    log::error!("Failed to encode commit {} for {}: {}", record.seq, self.doc_id, e);
                }
            }
            Err(e) => log::error!("Failed to encode commit {} for {}: {}", record.seq, self.doc_id, e),
        }
    }
}

//! Document rooms: one sequencer and one broadcast group per document.
//!
//! Commit decisions for a document are serialized by the room's sequencer
//! mutex; different documents never contend.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::PeerInfo;
use crate::sequencer::{Sequencer, SequencerConfig};

pub struct DocumentRoom {
    doc_id: Uuid,
    sequencer: Mutex<Sequencer>,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    pub fn new(doc_id: Uuid, capacity: usize, config: SequencerConfig) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(doc_id, capacity));
        let sequencer = Sequencer::new(config, broadcast.clone());
        Self {
            doc_id,
            sequencer: Mutex::new(sequencer),
            broadcast,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// The room's sequencer. Hold the guard only for the duration of one
    /// submission or snapshot export.
    pub fn sequencer(&self) -> &Mutex<Sequencer> {
        &self.sequencer
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<Uuid, Arc<DocumentRoom>>>>,
    default_capacity: usize,
    sequencer_config: SequencerConfig,
}

impl RoomManager {
    pub fn new(default_capacity: usize, sequencer_config: SequencerConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
            sequencer_config,
        }
    }

    /// Register `info` in the room for `doc_id`, creating the room if
    /// needed. Returns `None` when the room already holds `max_peers`.
    ///
    /// Registration happens under the registry lock, so a concurrent
    /// [`remove_if_empty`](Self::remove_if_empty) either sees the new peer or
    /// runs before the room is looked up.
    pub async fn join(
        &self,
        doc_id: Uuid,
        info: PeerInfo,
        max_peers: usize,
    ) -> Option<(Arc<DocumentRoom>, broadcast::Receiver<Arc<Vec<u8>>>)> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(&doc_id) {
            Some(room) => room.clone(),
            None => {
                log::info!("Opening document {}", doc_id);
                let room = Arc::new(DocumentRoom::new(
                    doc_id,
                    self.default_capacity,
                    self.sequencer_config.clone(),
                ));
                rooms.insert(doc_id, room.clone());
                room
            }
        };
        let peers = room.broadcast().peer_count().await;
        if peers >= max_peers {
            if peers == 0 {
                rooms.remove(&doc_id);
            }
            return None;
        }
        let rx = room.broadcast().add_peer(info).await;
        Some((room, rx))
    }

    /// Drop a room once its last peer has left. The document's state goes
    /// with it.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.broadcast().peer_count().await == 0 {
                rooms.remove(doc_id);
                log::info!("Closed document {}", doc_id);
                return true;
            }
        }
        false
    }

    /// Every open room.
    pub async fn rooms(&self) -> Vec<Arc<DocumentRoom>> {
        self.rooms.read().await.values().cloned().collect()
    }
}

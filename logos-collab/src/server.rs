//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  Submit                 ┌──────────────────────────────┐
//!             ├────────────▶ Room ──────▶ Sequencer (mutex per doc)    │
//! Client B ──┘  (doc_id)                │   rebase ─▶ commit ─▶ sink  │
//!                                       └───────────────────┬──────────┘
//!                                                           ▼
//!                                                  BroadcastGroup (Commit)
//!                          ┌──────────────────┬─────────────┴─────┐
//!                          ▼                  ▼                   ▼
//!                       Client A           Client B            Client C
//! ```
//!
//! Each connection joins one document. The server answers a join with a
//! snapshot, forwards every commit of the room to every peer (including the
//! operation's origin), answers refused operations with a rejection to the
//! origin only, and answers stale or lagging peers with a fresh snapshot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use logos_canvas::{OperationError, SiteId};

use crate::protocol::{MessageType, PeerInfo, ProtocolError, Rejection, SyncMessage};
use crate::room::{DocumentRoom, RoomManager};
use crate::sequencer::{SequencerConfig, SequencerError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Sequencer settings for every room
    pub sequencer: SequencerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            sequencer: SequencerConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub commits: u64,
    pub rejections: u64,
    pub snapshots_sent: u64,
    /// Room messages lagging peers skipped, over all open rooms
    pub messages_dropped: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity, config.sequencer.clone()));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration on the given address.
    pub fn with_defaults(bind_addr: impl Into<String>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = Connection {
                addr,
                config: self.config.clone(),
                rooms: self.room_manager.clone(),
                stats: self.stats.clone(),
                peer: None,
            };
            tokio::spawn(async move {
                if let Err(e) = connection.run(stream).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let rooms = self.room_manager.rooms().await;
        stats.active_rooms = rooms.len();
        for room in rooms {
            stats.messages_dropped += room.broadcast().stats().await.messages_dropped;
        }
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}

/// A joined peer's membership.
struct Membership {
    peer_id: Uuid,
    /// Site every submitted operation must be stamped with.
    site: SiteId,
    room: Arc<DocumentRoom>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// One client connection.
struct Connection {
    addr: SocketAddr,
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    peer: Option<Membership>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let addr = self.addr;

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match SyncMessage::decode(&data) {
                                    Ok(sync_msg) => {
                                        if !self.handle(sync_msg, &mut ws_sender).await? {
                                            break;
                                        }
                                    }
                                    Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    msg = async {
                        match self.peer.as_mut() {
                            Some(member) => member.rx.recv().await,
                            // Not joined yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => self.forward(data, &mut ws_sender).await?,
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Peer at {addr} lagged by {n} messages, resyncing");
                                if let Some(member) = self.peer.as_ref() {
                                    member.room.broadcast().record_dropped(n);
                                }
                                self.send_snapshot(&mut ws_sender).await?;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }

                    _ = heartbeat.tick() => {
                        if let Some(member) = self.peer.as_ref() {
                            send(&mut ws_sender, &SyncMessage::ping(member.peer_id)).await?;
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        self.leave().await;
        result
    }

    /// Process one client message. Returns `false` to close the connection.
    async fn handle<S>(&mut self, msg: SyncMessage, ws: &mut S) -> Result<bool, BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        match msg.msg_type {
            MessageType::Join => {
                if self.peer.is_some() {
                    log::warn!("Duplicate join from {}", self.addr);
                    return Ok(true);
                }
                let info = msg
                    .peer_info()
                    .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "Anonymous"));
                return self.join(msg.doc_id, info, ws).await;
            }
            MessageType::Submit => {
                let Some(member) = self.peer.as_ref() else {
                    log::warn!("Submit before join from {}", self.addr);
                    return Ok(true);
                };
                let op = match msg.operation() {
                    Ok(op) => op,
                    Err(ProtocolError::Operation(OperationError::Malformed { op_id, reason })) => {
                        self.reject(Rejection { op_id, reason }, ws).await?;
                        return Ok(true);
                    }
                    Err(e) => {
                        log::warn!("Undecodable submission from {}: {}", self.addr, e);
                        return Ok(true);
                    }
                };
                let op_id = op.id;
                if op_id.site != member.site {
                    let reason = format!(
                        "operation stamped with site {} by a peer of site {}",
                        op_id.site.0, member.site.0
                    );
                    self.reject(Rejection { op_id, reason }, ws).await?;
                    return Ok(true);
                }
                let outcome = member.room.sequencer().lock().await.submit(op);
                match outcome {
                    Ok(_) => self.stats.write().await.commits += 1,
                    Err(e @ SequencerError::ResyncRequired { .. }) => {
                        log::info!("{} from {}: {}", op_id, self.addr, e);
                        self.send_snapshot(ws).await?;
                    }
                    Err(e) => {
                        self.reject(
                            Rejection {
                                op_id,
                                reason: e.to_string(),
                            },
                            ws,
                        )
                        .await?;
                    }
                }
            }
            MessageType::SnapshotRequest => self.send_snapshot(ws).await?,
            MessageType::Ping => send(ws, &SyncMessage::pong(msg.peer_id)).await?,
            MessageType::Pong => log::trace!("Pong from {}", self.addr),
            other => log::debug!("Unhandled message type: {:?}", other),
        }
        Ok(true)
    }

    async fn join<S>(&mut self, doc_id: Uuid, info: PeerInfo, ws: &mut S) -> Result<bool, BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let peer_id = info.peer_id;
        // Subscribe before exporting so no commit falls between the two.
        let joined = self
            .rooms
            .join(doc_id, info.clone(), self.config.max_peers_per_room)
            .await;
        let Some((room, rx)) = joined else {
            log::warn!("Room {} is full, refusing {}", doc_id, self.addr);
            ws.send(Message::Close(None)).await?;
            return Ok(false);
        };
        log::info!("Peer {} ({}) joined document {}", info.name, peer_id, doc_id);
        self.peer = Some(Membership {
            peer_id,
            site: info.site(),
            room: room.clone(),
            rx,
        });
        self.send_snapshot(ws).await?;

        if let Err(e) = room.broadcast().broadcast(&SyncMessage::peer_joined(doc_id, &info)?) {
            log::warn!("Failed to announce {}: {}", peer_id, e);
        }
        Ok(true)
    }

    /// Forward a room message. Commits go to everyone; anything else is not
    /// echoed to its sender.
    async fn forward<S>(&self, data: Arc<Vec<u8>>, ws: &mut S) -> Result<(), BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        if let (Ok(msg), Some(member)) = (SyncMessage::decode(&data), self.peer.as_ref()) {
            if msg.msg_type != MessageType::Commit && msg.peer_id == member.peer_id {
                return Ok(());
            }
        }
        ws.send(Message::Binary(data.to_vec().into())).await?;
        Ok(())
    }

    async fn send_snapshot<S>(&self, ws: &mut S) -> Result<(), BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let Some(member) = self.peer.as_ref() else {
            return Ok(());
        };
        let snapshot = member.room.sequencer().lock().await.export_snapshot();
        log::debug!("Sending snapshot at seq {} to {}", snapshot.seq, self.addr);
        send(ws, &SyncMessage::snapshot(member.room.doc_id(), &snapshot)?).await?;
        self.stats.write().await.snapshots_sent += 1;
        Ok(())
    }

    async fn reject<S>(&self, rejection: Rejection, ws: &mut S) -> Result<(), BoxError>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        let (peer_id, doc_id) = match self.peer.as_ref() {
            Some(member) => (member.peer_id, member.room.doc_id()),
            None => (Uuid::nil(), Uuid::nil()),
        };
        log::warn!("Rejecting {} from {}: {}", rejection.op_id, self.addr, rejection.reason);
        send(ws, &SyncMessage::reject(peer_id, doc_id, &rejection)?).await?;
        self.stats.write().await.rejections += 1;
        Ok(())
    }

    async fn leave(&mut self) {
        if let Some(member) = self.peer.take() {
            let doc_id = member.room.doc_id();
            member.room.broadcast().remove_peer(&member.peer_id).await;
            let _ = member.room.broadcast().broadcast(&SyncMessage::peer_left(member.peer_id, doc_id));
            drop(member);
            self.rooms.remove_if_empty(&doc_id).await;
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

async fn send<S>(ws: &mut S, msg: &SyncMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    ws.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

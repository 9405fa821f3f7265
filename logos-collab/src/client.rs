//! WebSocket sync client for connecting to the sequencing server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect via snapshot)
//! - Local edits applied optimistically through a [`ClientSession`]
//! - Submission of one operation at a time and integration of the commit
//!   stream
//! - A [`SyncEvent`] feed carrying view deltas for the renderer

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_canvas::{CanvasObject, FieldPatch, ObjectDelta, ObjectId, OpId, OpKind};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::session::{ClientSession, SessionConfig, SessionError, SessionState};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The view changed (local edit, remote commit, rebase or resync)
    Applied(Vec<ObjectDelta>),
    /// The sequencer refused one of our operations
    Rejected { op_id: OpId, reason: String },
    /// State replaced by a snapshot at `seq`
    Resynced { seq: u64 },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Sender half shared by the connection tasks and edit calls.
type Outgoing = Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>;

/// The sync client.
///
/// Owns the document session for one peer and keeps it in step with the
/// server over a WebSocket.
pub struct SyncClient {
    peer_info: PeerInfo,

    doc_id: Uuid,

    state: Arc<RwLock<ConnectionState>>,

    session: Arc<Mutex<ClientSession>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Outgoing,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    event_tx: mpsc::Sender<SyncEvent>,

    server_url: String,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_config(peer_info, doc_id, server_url, SessionConfig::default())
    }

    pub fn with_config(
        peer_info: PeerInfo,
        doc_id: Uuid,
        server_url: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let mut session = ClientSession::new(peer_info.site(), config);
        // The document is unknown until the server's first snapshot.
        session.request_resync();
        Self {
            peer_info,
            doc_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session: Arc::new(Mutex::new(session)),
            outgoing_tx: Arc::new(RwLock::new(None)),
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and join the document.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages. The
    /// session stays in resync until the server's snapshot arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.session.lock().await.request_resync();

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", url, e);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing_tx.write().await = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        let join = SyncMessage::join(self.doc_id, &self.peer_info)?;
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader task: feed the commit stream into the session
        let reader = Reader {
            peer_id: self.peer_info.peer_id,
            doc_id: self.doc_id,
            session: self.session.clone(),
            outgoing: out_tx,
            events: self.event_tx.clone(),
        };
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let session = self.session.clone();
        let outgoing = self.outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => reader.handle(sync_msg).await,
                        Err(e) => log::warn!("Dropping undecodable message: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: whatever was pending is resolved by the next
            // snapshot.
            *outgoing.write().await = None;
            session.lock().await.request_resync();
            *state.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        });

        Ok(())
    }

    /// Apply a local edit and send it when the sequencer is free.
    pub async fn edit(&self, kind: OpKind) -> Result<OpId, ClientError> {
        self.with_session(|session| session.edit(kind)).await
    }

    pub async fn insert(&self, object: CanvasObject) -> Result<OpId, ClientError> {
        self.with_session(|session| session.insert(object)).await
    }

    pub async fn update(&self, target: ObjectId, patch: FieldPatch) -> Result<OpId, ClientError> {
        self.with_session(|session| session.update(target, patch)).await
    }

    pub async fn delete(&self, target: ObjectId) -> Result<OpId, ClientError> {
        self.with_session(|session| session.delete(target)).await
    }

    pub async fn reorder(&self, target: ObjectId, layer_order: i64) -> Result<OpId, ClientError> {
        self.with_session(|session| session.reorder(target, layer_order)).await
    }

    pub async fn begin_gesture(&self) {
        self.session.lock().await.begin_gesture();
    }

    pub async fn end_gesture(&self) {
        self.session.lock().await.end_gesture();
    }

    /// Undo the most recent entry; `None` when nothing remained to revert.
    pub async fn undo(&self) -> Result<Option<OpId>, ClientError> {
        self.with_session(|session| session.undo()).await
    }

    pub async fn redo(&self) -> Result<Option<OpId>, ClientError> {
        self.with_session(|session| session.redo()).await
    }

    async fn with_session<T>(
        &self,
        f: impl FnOnce(&mut ClientSession) -> Result<T, SessionError>,
    ) -> Result<T, ClientError> {
        let mut session = self.session.lock().await;
        let result = f(&mut session)?;
        let deltas = session.drain_deltas();
        if !deltas.is_empty() {
            emit(&self.event_tx, SyncEvent::Applied(deltas));
        }
        if let Some(tx) = self.outgoing_tx.read().await.as_ref() {
            flush(&mut session, tx, self.peer_info.peer_id, self.doc_id).await?;
        }
        Ok(result)
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = SyncMessage::ping(self.peer_info.peer_id).encode()?;
        match self.outgoing_tx.read().await.as_ref() {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The underlying session, for reading the view.
    pub fn session(&self) -> &Arc<Mutex<ClientSession>> {
        &self.session
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Deliver an event without waiting; the session lock may be held.
fn emit(events: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = events.try_send(event) {
        log::debug!("Dropping sync event: {}", e);
    }
}

/// Send the next pending operation if none is in flight.
async fn flush(
    session: &mut ClientSession,
    tx: &mpsc::Sender<Vec<u8>>,
    peer_id: Uuid,
    doc_id: Uuid,
) -> Result<(), ProtocolError> {
    if let Some(op) = session.take_outgoing() {
        log::trace!("Submitting {} at base {}", op.id, op.base_seq);
        let encoded = SyncMessage::submit(peer_id, doc_id, &op)?.encode()?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)?;
    }
    Ok(())
}

/// State the reader task needs to process server messages.
struct Reader {
    peer_id: Uuid,
    doc_id: Uuid,
    session: Arc<Mutex<ClientSession>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<SyncEvent>,
}

impl Reader {
    async fn handle(&self, msg: SyncMessage) {
        let event = match msg.msg_type {
            MessageType::Commit | MessageType::Reject | MessageType::Snapshot => {
                let mut session = self.session.lock().await;
                let event = match self.integrate(&mut session, &msg).await {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Failed to integrate {:?}: {}", msg.msg_type, e);
                        None
                    }
                };
                let deltas = session.drain_deltas();
                if !deltas.is_empty() {
                    emit(&self.events, SyncEvent::Applied(deltas));
                }
                if let Err(e) = flush(&mut session, &self.outgoing, self.peer_id, self.doc_id).await {
                    log::warn!("Failed to submit: {}", e);
                }
                event
            }
            MessageType::PeerJoined if msg.peer_id != self.peer_id => msg.peer_info().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Ping => {
                if let Ok(pong) = SyncMessage::pong(self.peer_id).encode() {
                    let _ = self.outgoing.send(pong).await;
                }
                None
            }
            _ => None,
        };
        if let Some(event) = event {
            emit(&self.events, event);
        }
    }

    async fn integrate(
        &self,
        session: &mut ClientSession,
        msg: &SyncMessage,
    ) -> Result<Option<SyncEvent>, ClientError> {
        match msg.msg_type {
            MessageType::Commit => {
                let record = msg.commit_record()?;
                match session.receive(&record) {
                    Err(e) if session.state() == SessionState::Resyncing => {
                        log::info!("{}; requesting snapshot", e);
                        let request = SyncMessage::snapshot_request(self.peer_id, self.doc_id).encode()?;
                        self.outgoing
                            .send(request)
                            .await
                            .map_err(|_| ProtocolError::ConnectionClosed)?;
                        Ok(None)
                    }
                    other => other.map(|_| None).map_err(ClientError::from),
                }
            }
            MessageType::Reject => {
                let rejection = msg.rejection()?;
                log::warn!("Operation {} rejected: {}", rejection.op_id, rejection.reason);
                session.rejected(rejection.op_id);
                Ok(Some(SyncEvent::Rejected {
                    op_id: rejection.op_id,
                    reason: rejection.reason,
                }))
            }
            MessageType::Snapshot => {
                let snapshot = msg.snapshot_payload()?;
                let seq = snapshot.seq;
                session.reset_from_snapshot(snapshot);
                Ok(Some(SyncEvent::Resynced { seq }))
            }
            _ => Ok(None),
        }
    }
}

//! WebSocket relay with room-based document routing.
//!
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── yrs Doc ── BroadcastGroup
//! Client B ──┘                                   │
//!                                  ┌─────────────┼─────────────┐
//!                                  ▼             ▼             ▼
//!                               Client A      Client B      Client C
//! ```
//!
//! Each room keeps an in-memory yrs `Doc` merged from every delta that
//! passes through, so a late joiner gets the full text in its first
//! `SyncStep2`. Nothing is persisted; a room and its doc are dropped when
//! the last peer leaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use playpen_core::DocumentId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Joins beyond this are refused and the socket closed.
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it lags.
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_peers: u64,
}

struct DocumentRoom {
    doc: yrs::Doc,
    group: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: yrs::Doc::new(),
            group: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn apply(&self, update: &[u8]) -> Result<(), String> {
        let update = Update::decode_v1(update).map_err(|e| e.to_string())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|e| e.to_string())
    }

    fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, String> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| e.to_string())?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, DocumentRoom>>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Who this socket is, once it has joined.
struct Joined {
    peer_id: Uuid,
    doc_id: Uuid,
    group: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Frame>,
}

pub struct SyncServer {
    config: ServerConfig,
    rooms: Rooms,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;
        let result = Self::relay(
            &mut ws_sender,
            &mut ws_receiver,
            &mut joined,
            addr,
            &rooms,
            &stats,
            &config,
        )
        .await;

        if let Some(j) = joined {
            Self::leave(&rooms, &stats, j).await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    async fn relay(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        joined: &mut Option<Joined>,
        addr: SocketAddr,
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes = match msg {
                        Some(Ok(Message::Binary(data))) => data.to_vec(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    if joined.is_none() {
                        if sync_msg.msg_type != MessageType::PeerJoined {
                            log::debug!("Ignoring {:?} from {addr} before join", sync_msg.msg_type);
                            continue;
                        }
                        let Some((room_joined, state)) =
                            Self::join(rooms, stats, config, &sync_msg, bytes).await
                        else {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        };
                        let doc_id = DocumentId::from(room_joined.doc_id);
                        *joined = Some(room_joined);
                        // Full state first, then our state vector so the
                        // peer pushes back whatever the room is missing.
                        let (update, state_vector) = state;
                        let reply = SyncMessage::sync_step2(Uuid::nil(), doc_id, update);
                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        let request = SyncMessage::sync_step1(Uuid::nil(), doc_id, state_vector);
                        ws_sender.send(Message::Binary(request.encode()?.into())).await?;
                        continue;
                    }
                    let Some(current) = joined.as_ref() else {
                        continue;
                    };

                    let frame = Frame {
                        sender: current.peer_id,
                        bytes: bytes.into(),
                    };
                    match sync_msg.msg_type {
                        MessageType::Delta => {
                            let op = match sync_msg.replica_op() {
                                Ok(op) => op,
                                Err(e) => {
                                    log::warn!("Malformed delta from {addr}: {e}");
                                    continue;
                                }
                            };
                            let applied = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(&current.doc_id).map(|room| room.apply(&op.update))
                            };
                            match applied {
                                Some(Ok(())) => {
                                    current.group.broadcast_frame(frame);
                                }
                                Some(Err(e)) => {
                                    log::warn!("Discarding delta v{} from {}: {e}", op.version, op.origin);
                                }
                                None => {}
                            }
                        }

                        MessageType::SyncStep1 => {
                            let diff = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(&current.doc_id).map(|room| room.diff(&sync_msg.payload))
                            };
                            match diff {
                                Some(Ok(diff)) => {
                                    let reply = SyncMessage::sync_step2(
                                        Uuid::nil(),
                                        DocumentId::from(current.doc_id),
                                        diff,
                                    );
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                                Some(Err(e)) => log::warn!("Bad state vector from {addr}: {e}"),
                                None => {}
                            }
                        }

                        MessageType::SyncStep2 => {
                            // A peer pushing state the room may not have seen.
                            let applied = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(&current.doc_id).map(|room| room.apply(&sync_msg.payload))
                            };
                            match applied {
                                Some(Ok(())) => {
                                    current.group.broadcast_frame(frame);
                                }
                                Some(Err(e)) => log::warn!("Discarding sync update from {addr}: {e}"),
                                None => {}
                            }
                        }

                        MessageType::Awareness => {
                            match sync_msg.awareness_message() {
                                Ok(AwarenessMessage::State { name, buffer, .. }) => {
                                    log::trace!("Presence: {name} on {buffer} in room {}", current.doc_id);
                                }
                                Ok(AwarenessMessage::Leave { user_id }) => {
                                    log::info!("Presence: {user_id} left room {}", current.doc_id);
                                }
                                Err(e) => {
                                    log::warn!("Malformed presence from {addr}: {e}");
                                    continue;
                                }
                            }
                            current.group.broadcast_frame(frame);
                        }

                        MessageType::Ping => {
                            let pong = SyncMessage::pong(Uuid::nil());
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }

                        other => {
                            log::debug!("Unhandled message type {other:?} from {addr}");
                        }
                    }
                }

                frame = async {
                    match joined.as_mut() {
                        Some(j) => j.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(current) = joined.as_ref() else {
                        continue;
                    };
                    match frame {
                        Ok(frame) => {
                            if frame.sender == current.peer_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {} lagged by {n} messages, resending state", current.peer_id);
                            current.group.record_dropped(n);
                            let state = {
                                let rooms_r = rooms.read().await;
                                rooms_r.get(&current.doc_id).map(DocumentRoom::full_state)
                            };
                            if let Some(state) = state {
                                let reply = SyncMessage::sync_step2(
                                    Uuid::nil(),
                                    DocumentId::from(current.doc_id),
                                    state,
                                );
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    /// Admit the peer to its room. Returns the join state with the room's
    /// full state and state vector, or `None` when the join is refused.
    async fn join(
        rooms: &Rooms,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        msg: &SyncMessage,
        bytes: Vec<u8>,
    ) -> Option<(Joined, (Vec<u8>, Vec<u8>))> {
        let info = match msg.peer_info() {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Malformed join for doc {}: {e}", msg.doc_id);
                return None;
            }
        };

        let mut rooms_w = rooms.write().await;
        let room = rooms_w
            .entry(msg.doc_id)
            .or_insert_with(|| DocumentRoom::new(config.broadcast_capacity));

        let count = room.group.peer_count().await;
        if count >= config.max_peers_per_room {
            log::warn!(
                "Refusing {} on doc {}: room full ({count} peers)",
                info.peer_id,
                msg.doc_id
            );
            if count == 0 {
                rooms_w.remove(&msg.doc_id);
            }
            drop(rooms_w);
            stats.write().await.rejected_peers += 1;
            return None;
        }

        let rx = room.group.add_peer(info.clone()).await;
        let state = (room.full_state(), room.state_vector());
        let group = room.group.clone();
        let room_count = rooms_w.len();
        drop(rooms_w);

        group.broadcast_frame(Frame {
            sender: info.peer_id,
            bytes: bytes.into(),
        });
        stats.write().await.active_rooms = room_count;
        log::info!("Peer {} ({}) joined doc {}", info.name, info.peer_id, msg.doc_id);

        Some((
            Joined {
                peer_id: info.peer_id,
                doc_id: msg.doc_id,
                group,
                rx,
            },
            state,
        ))
    }

    async fn leave(rooms: &Rooms, stats: &Arc<RwLock<ServerStats>>, joined: Joined) {
        let mut rooms_w = rooms.write().await;
        joined.group.remove_peer(&joined.peer_id).await;
        if let Err(e) = joined
            .group
            .broadcast(&SyncMessage::peer_left(joined.peer_id, joined.doc_id))
        {
            log::warn!("Could not announce departure of {}: {e}", joined.peer_id);
        }

        if joined.group.peer_count().await == 0 {
            rooms_w.remove(&joined.doc_id);
            log::info!("Room {} removed (empty)", joined.doc_id);
        }
        let room_count = rooms_w.len();
        drop(rooms_w);

        stats.write().await.active_rooms = room_count;
        log::info!("Peer {} left doc {}", joined.peer_id, joined.doc_id);
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_document_room_full_state_and_diff() {
        let source = yrs::Doc::new();
        let update = {
            let mut txn = source.transact_mut();
            let text = txn.get_or_insert_text("source");
            text.insert(&mut txn, 0, "<p>relay</p>");
            txn.encode_update_v1()
        };

        let room = DocumentRoom::new(8);
        room.apply(&update).unwrap();
        assert_eq!(room.group.capacity(), 8);

        let late = yrs::Doc::new();
        {
            let mut txn = late.transact_mut();
            txn.apply_update(Update::decode_v1(&room.full_state()).unwrap())
                .unwrap();
        }
        let txn = late.transact();
        assert_eq!(txn.get_text("source").unwrap().get_string(&txn), "<p>relay</p>");

        let empty_sv = yrs::Doc::new().transact().state_vector();
        assert!(!room.diff(&empty_sv.encode_v1()).unwrap().is_empty());
        assert!(room.diff(&room.state_vector()).is_ok());
        assert!(room.apply(&[0xFF, 0x01]).is_err());
    }
}

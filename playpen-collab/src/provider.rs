//! The network provider seam.
//!
//! A provider joins one replication channel, delivers every message from
//! other participants on that channel, and sends ours. It reports its
//! connection state through a `watch` channel so a UI can show a soft
//! connectivity indicator.
//!
//! [`MemoryHub`] is an in-process provider with no relay: peers on the
//! same hub exchange messages directly and answer each other's sync
//! requests. It is used for tests and for embedding several editors in
//! one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use playpen_core::DocumentId;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connecting again after an earlier connection was lost.
    Reconnecting,
}

/// Messages from other participants, in arrival order. Closes when the
/// connection is lost.
pub type Inbound = mpsc::UnboundedReceiver<SyncMessage>;

#[async_trait]
pub trait NetworkProvider: Send {
    /// Join the channel for `doc_id`, announcing `peer`.
    async fn connect(&mut self, doc_id: DocumentId, peer: &PeerInfo)
        -> Result<Inbound, ProtocolError>;

    /// Queue a message for the channel. Never blocks.
    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError>;

    /// Leave the channel. Nothing is delivered after this returns.
    fn disconnect(&mut self);

    fn state(&self) -> watch::Receiver<ConnectionState>;
}

/// Connection state shared between a provider and its background tasks.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct HubControl {
    /// Per-peer kill switch for simulated drops.
    links: HashMap<Uuid, Arc<Notify>>,
    unreachable: bool,
}

/// In-process channel hub.
#[derive(Clone)]
pub struct MemoryHub {
    rooms: Arc<RoomManager>,
    control: Arc<Mutex<HubControl>>,
}

impl MemoryHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(capacity)),
            control: Arc::new(Mutex::new(HubControl::default())),
        }
    }

    /// A provider attached to this hub.
    pub fn provider(&self) -> MemoryProvider {
        MemoryProvider {
            hub: self.clone(),
            state: StateCell::new(),
            link: None,
            retired: None,
            connected_once: false,
        }
    }

    /// Make every later `connect` fail until set back.
    pub fn set_reachable(&self, reachable: bool) {
        self.control().unreachable = !reachable;
    }

    /// Cut one peer's link as if its network dropped.
    pub fn drop_peer(&self, peer_id: &Uuid) -> bool {
        match self.control().links.remove(peer_id) {
            Some(kill) => {
                kill.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    fn control(&self) -> std::sync::MutexGuard<'_, HubControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Link {
    peer_id: Uuid,
    group: Arc<BroadcastGroup>,
    kill: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct MemoryProvider {
    hub: MemoryHub,
    state: StateCell,
    link: Option<Link>,
    /// Forwarding task of the previous link, still cleaning up.
    retired: Option<JoinHandle<()>>,
    connected_once: bool,
}

#[async_trait]
impl NetworkProvider for MemoryProvider {
    async fn connect(
        &mut self,
        doc_id: DocumentId,
        peer: &PeerInfo,
    ) -> Result<Inbound, ProtocolError> {
        self.disconnect();
        if let Some(task) = self.retired.take() {
            let _ = task.await;
        }
        self.state.set(if self.connected_once {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        if self.hub.control().unreachable {
            self.state.set(ConnectionState::Disconnected);
            return Err(ProtocolError::ConnectionClosed);
        }

        let (group, mut rx) = self.hub.rooms.join(doc_id, peer.clone()).await;
        let kill = Arc::new(Notify::new());
        self.hub.control().links.insert(peer.peer_id, kill.clone());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer_id = peer.peer_id;
        let state = self.state.clone();
        let forward_group = group.clone();
        let rooms = self.hub.rooms.clone();
        let killed = kill.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = killed.notified() => break,
                    frame = rx.recv() => match frame {
                        Ok(frame) => {
                            if frame.sender == peer_id {
                                continue;
                            }
                            match SyncMessage::decode(&frame.bytes) {
                                Ok(msg) => {
                                    if inbound_tx.send(msg).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id} lagged by {n} messages, resyncing");
                            forward_group.record_dropped(n);
                            if inbound_tx.send(SyncMessage::resync(doc_id)).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            // Peers learn of the departure the same way a relay would tell them.
            if rooms.leave(doc_id, &peer_id).await.is_some() {
                let _ = forward_group.broadcast(&SyncMessage::peer_left(peer_id, doc_id.as_uuid()));
            }
            state.set(ConnectionState::Disconnected);
        });

        group.broadcast(&SyncMessage::peer_joined(doc_id, peer)?)?;
        self.link = Some(Link {
            peer_id,
            group,
            kill,
            task,
        });
        self.connected_once = true;
        self.state.set(ConnectionState::Connected);
        Ok(inbound_rx)
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        match &self.link {
            Some(link) if self.state.get() == ConnectionState::Connected => {
                link.group.broadcast(msg).map(|_| ())
            }
            _ => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.kill.notify_one();
            self.hub.control().links.remove(&link.peer_id);
            self.retired = Some(link.task);
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.kill.notify_one();
        }
    }
}

//! Fan-out of encoded frames to every peer of a room.
//!
//! Each room is one tokio broadcast channel. A frame is encoded once and
//! shared by all receivers; every receiver buffers up to `capacity`
//! frames before it starts lagging and dropping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use playpen_core::DocumentId;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// One encoded message plus its sender, so receivers can skip their own
/// frames without decoding them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: Uuid,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send to every receiver, the sender's own included.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Frame {
            sender: msg.peer_id,
            bytes: msg.encode()?.into(),
        };
        Ok(self.broadcast_frame(frame))
    }

    /// Forward an already-encoded frame.
    pub fn broadcast_frame(&self, frame: Frame) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        // Err only means nobody is subscribed right now
        self.sender.send(frame).unwrap_or(0)
    }

    /// Count frames a lagging receiver missed.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One broadcast group per document channel, created on first use and
/// dropped when its last peer leaves.
pub struct RoomManager {
    groups: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Add `info` to the room for `doc_id`, creating the room if needed.
    ///
    /// Holds the map lock across the add so a concurrent [`leave`](Self::leave)
    /// cannot drop the room between lookup and join.
    pub async fn join(
        &self,
        doc_id: DocumentId,
        info: PeerInfo,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Frame>) {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone();
        let rx = group.add_peer(info).await;
        (group, rx)
    }

    /// Remove a peer and drop its room once empty.
    pub async fn leave(&self, doc_id: DocumentId, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut groups = self.groups.write().await;
        let group = groups.get(&doc_id)?.clone();
        let left = group.remove_peer(peer_id).await;
        if group.peer_count().await == 0 {
            groups.remove(&doc_id);
            log::debug!("Room {doc_id} removed (empty)");
        }
        left
    }

    /// Drop the room for `doc_id` if nobody is in it.
    pub async fn remove_if_empty(&self, doc_id: DocumentId) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get(&doc_id) else {
            return false;
        };
        if group.peer_count().await > 0 {
            return false;
        }
        groups.remove(&doc_id);
        true
    }

    pub async fn get(&self, doc_id: DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(&doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

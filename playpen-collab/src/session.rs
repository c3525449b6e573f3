//! One collaborative editing session per buffer kind.
//!
//! A session binds a buffer kind to its replication channel. It feeds
//! local edits into the shared [`ReplicaManager`], merges whatever arrives
//! from the channel, keeps presence alive with a heartbeat and evicts
//! silent participants into the shared [`CollaboratorRegistry`].
//!
//! ```text
//! local_edit ──▸ ReplicaManager ──▸ Delta ──▸ provider ──▸ peers
//!                                      │ offline
//!                                      ▼
//!                                OfflineQueue ──▸ flushed on reconnect
//!
//! next_update ◂── select { inbound, connection state, heartbeat, seed deadline }
//! ```
//!
//! The session is driven by awaiting [`CollabSession::next_update`] in a
//! loop; nothing happens in the background besides the provider's own
//! socket tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use playpen_core::{
    BufferKind, DocumentId, MergeOutcome, ReplicaError, ReplicaManager, ReplicaOp, TextPatch,
};
use tokio::sync::watch;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::client::SyncClient;
use crate::presence::{AwarenessService, Cursor, PresenceChange};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::provider::{ConnectionState, Inbound, NetworkProvider};
use crate::queue::OfflineQueue;
use crate::registry::{Collaborator, CollaboratorRegistry, Roster, SubscriptionId};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL, used by [`CollabSession::open_relay`].
    pub server_url: String,
    pub heartbeat_interval: Duration,
    /// Silence after which a participant is evicted. Must exceed
    /// `heartbeat_interval`.
    pub presence_timeout: Duration,
    pub offline_queue_capacity: usize,
    /// How long to wait for the first `SyncStep2` before seeding an empty
    /// replica with the local text.
    pub sync_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            presence_timeout: Duration::from_secs(30),
            offline_queue_capacity: 10_000,
            sync_timeout: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.presence_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutNotAboveHeartbeat {
                heartbeat: self.heartbeat_interval,
                timeout: self.presence_timeout,
            });
        }
        if self.offline_queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Heartbeat interval must be non-zero")]
    ZeroHeartbeat,

    #[error("Presence timeout {timeout:?} must exceed heartbeat interval {heartbeat:?}")]
    TimeoutNotAboveHeartbeat { heartbeat: Duration, timeout: Duration },

    #[error("Offline queue capacity must be non-zero")]
    ZeroQueueCapacity,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Session closed")]
    Closed,
}

/// Replica and roster state shared by the sessions of one editor.
///
/// Cloning is cheap; every clone refers to the same state.
#[derive(Clone, Default)]
pub struct Workspace {
    replicas: Arc<Mutex<ReplicaManager>>,
    registry: Arc<Mutex<CollaboratorRegistry>>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_text(&self, kind: BufferKind) -> String {
        self.replicas().current_text(kind)
    }

    /// Called with the full roster on every visible change. The callback
    /// runs while the registry is locked and must not call back into this
    /// workspace's roster methods.
    pub fn subscribe(&self, callback: impl FnMut(&Roster) + Send + 'static) -> SubscriptionId {
        self.registry().subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry().unsubscribe(id)
    }

    pub fn roster(&self) -> Roster {
        self.registry().roster()
    }

    pub fn collaborators(&self, kind: BufferKind) -> Vec<Collaborator> {
        self.registry().for_kind(kind)
    }

    fn replicas(&self) -> MutexGuard<'_, ReplicaManager> {
        self.replicas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> MutexGuard<'_, CollaboratorRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the editor has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The buffer text after a remote change was merged.
    Text(String),
    /// The channel connected or dropped.
    Connection(ConnectionState),
}

pub struct CollabSession {
    kind: BufferKind,
    doc_id: DocumentId,
    workspace: Workspace,
    provider: Box<dyn NetworkProvider>,
    state_rx: watch::Receiver<ConnectionState>,
    inbound: Option<Inbound>,
    awareness: AwarenessService,
    queue: OfflineQueue,
    heartbeat: Interval,
    /// Local text to seed an empty replica with, until the first sync.
    pending_seed: Option<String>,
    seed_deadline: Option<Instant>,
    closed: bool,
}

impl CollabSession {
    /// Open a session for `kind` on page `page_id`.
    ///
    /// `initial_text` is the local buffer content. A connection failure
    /// is not an error: the session starts offline and queues edits
    /// until [`reconnect`](Self::reconnect) succeeds.
    pub async fn open(
        workspace: Workspace,
        kind: BufferKind,
        page_id: &str,
        local: PeerInfo,
        initial_text: impl Into<String>,
        provider: Box<dyn NetworkProvider>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let doc_id = DocumentId::derive(page_id, kind);
        let start = Instant::now() + config.heartbeat_interval;
        let mut heartbeat = time::interval_at(start, config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let initial_text = initial_text.into();
        let pending_seed = (!initial_text.is_empty()).then_some(initial_text);
        let seed_deadline = pending_seed
            .as_ref()
            .map(|_| Instant::now() + config.sync_timeout);

        let mut session = Self {
            kind,
            doc_id,
            workspace,
            state_rx: provider.state(),
            provider,
            inbound: None,
            awareness: AwarenessService::new(local, kind, config.presence_timeout),
            queue: OfflineQueue::new(config.offline_queue_capacity),
            heartbeat,
            pending_seed,
            seed_deadline,
            closed: false,
        };

        if let Err(e) = session.connect_channel().await {
            log::warn!("{kind} session for {page_id} starting offline: {e}");
        }
        log::info!(
            "Opened {kind} session on channel {doc_id} as {}",
            session.awareness.local().name
        );
        Ok(session)
    }

    /// [`open`](Self::open) over a WebSocket connection to
    /// `config.server_url`.
    pub async fn open_relay(
        workspace: Workspace,
        kind: BufferKind,
        page_id: &str,
        local: PeerInfo,
        initial_text: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let provider = Box::new(SyncClient::new(config.server_url.clone()));
        Self::open(workspace, kind, page_id, local, initial_text, provider, config).await
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn local(&self) -> &PeerInfo {
        self.awareness.local()
    }

    pub fn text(&self) -> String {
        self.workspace.current_text(self.kind)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver for a soft connectivity indicator.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.provider.state()
    }

    /// Ops waiting for a connection.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Apply a local edit and broadcast it, or queue it while offline.
    pub fn local_edit(&mut self, patch: &TextPatch) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        // The patch is relative to the local text, so the replica must
        // hold it first.
        self.seed_pending();

        let op = self.workspace.replicas().local_edit(self.kind, patch)?;
        if let Some(op) = op {
            self.deliver(op);
        }
        Ok(())
    }

    /// Edit towards `new_text`, for editors that report whole values.
    pub fn edit_to(&mut self, new_text: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.seed_pending();

        let current = self.text();
        match TextPatch::diff(&current, new_text) {
            Some(patch) => self.local_edit(&patch),
            None => Ok(()),
        }
    }

    /// Show peers where the local selection is, clamped to the text.
    /// `None` hides it.
    pub fn set_cursor(&mut self, cursor: Option<Cursor>) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let len = u32::try_from(self.text().len()).unwrap_or(u32::MAX);
        let cursor = cursor.map(|(anchor, head)| (anchor.min(len), head.min(len)));
        if self.awareness.set_cursor(cursor) {
            self.send_presence();
        }
        Ok(())
    }

    /// Re-establish the channel, then flush queued ops in order.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.connect_channel().await?;
        Ok(())
    }

    /// Wait for the next change the editor must see.
    ///
    /// Returns `None` once the session is closed.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.closed {
                return None;
            }

            tokio::select! {
                biased;

                msg = recv_or_pending(&mut self.inbound) => match msg {
                    Some(msg) => {
                        if let Some(update) = self.handle_message(msg) {
                            return Some(update);
                        }
                    }
                    None => {
                        log::info!("{} channel closed", self.kind);
                        self.inbound = None;
                    }
                },

                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let state = *self.state_rx.borrow_and_update();
                    return Some(SessionUpdate::Connection(state));
                }

                _ = self.heartbeat.tick() => self.on_heartbeat(),

                _ = sleep_until_or_pending(self.seed_deadline) => {
                    log::debug!("No sync answer on {} within timeout, seeding", self.kind);
                    self.seed_pending();
                }
            }
        }
    }

    /// Withdraw presence, leave the channel and discard the replica.
    ///
    /// Synchronous; nothing from the channel is processed afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match SyncMessage::awareness(self.local().peer_id, self.doc_id, &self.awareness.leave_message()) {
            Ok(leave) => {
                if let Err(e) = self.provider.send(&leave) {
                    log::debug!("Presence withdrawal not sent: {e}");
                }
            }
            Err(e) => log::warn!("Could not encode presence withdrawal: {e}"),
        }
        self.provider.disconnect();
        self.inbound = None;
        self.state_rx.borrow_and_update();

        self.queue.clear();
        self.pending_seed = None;
        self.seed_deadline = None;
        self.awareness.clear();
        self.workspace.replicas().discard(self.kind);
        self.workspace.registry().clear_kind(self.kind);
        log::info!("Closed {} session on channel {}", self.kind, self.doc_id);
    }

    async fn connect_channel(&mut self) -> Result<(), ProtocolError> {
        let result = self.provider.connect(self.doc_id, self.awareness.local()).await;
        // Our own transitions are not news to the caller.
        self.state_rx.borrow_and_update();
        self.inbound = Some(result?);

        let queued = self.queue.take_all();
        if !queued.is_empty() {
            log::info!("Replaying {} queued {} ops", queued.len(), self.kind);
        }
        for op in queued {
            self.deliver(op);
        }
        self.announce();
        Ok(())
    }

    /// Ask for what we are missing and show ourselves.
    fn announce(&mut self) {
        let state_vector = self.workspace.replicas().state_vector(self.kind);
        self.send(SyncMessage::sync_step1(self.local().peer_id, self.doc_id, state_vector));
        self.send_presence();
    }

    fn send_presence(&mut self) {
        match SyncMessage::awareness(self.local().peer_id, self.doc_id, &self.awareness.local_state()) {
            Ok(msg) => {
                self.send(msg);
            }
            Err(e) => log::warn!("Could not encode presence: {e}"),
        }
    }

    fn send(&mut self, msg: SyncMessage) -> bool {
        match self.provider.send(&msg) {
            Ok(()) => true,
            Err(e) => {
                log::trace!("{:?} not sent on {}: {e}", msg.msg_type, self.kind);
                false
            }
        }
    }

    fn deliver(&mut self, op: ReplicaOp) {
        let msg = match SyncMessage::delta(self.local().peer_id, self.doc_id, &op) {
            Ok(msg) => msg,
            Err(e) => {
                log::error!("Could not encode op v{}: {e}", op.version);
                return;
            }
        };
        if self.send(msg) {
            return;
        }
        if let Err(op) = self.queue.push(op) {
            // Still in the replica; the handshake on reconnect carries it.
            log::warn!(
                "Offline queue for {} full, op v{} left to resync",
                self.kind,
                op.version
            );
        }
    }

    /// Seed an empty replica with the local text, once.
    fn seed_pending(&mut self) -> bool {
        self.seed_deadline = None;
        let Some(text) = self.pending_seed.take() else {
            return false;
        };

        let seeded = self.workspace.replicas().seed_if_empty(self.kind, &text);
        match seeded {
            Ok(Some(op)) => {
                log::debug!("Seeded {} replica with {} bytes", self.kind, text.len());
                self.deliver(op);
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("Could not seed {} replica: {e}", self.kind);
                false
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if self.connection_state() == ConnectionState::Connected {
            self.send_presence();
        }
        let evicted = self.awareness.evict_stale(now());
        for change in &evicted {
            self.apply_presence(change);
        }
    }

    fn apply_presence(&self, change: &PresenceChange) {
        self.workspace.registry().apply(self.kind, change);
    }

    fn text_update(&self) -> SessionUpdate {
        SessionUpdate::Text(self.text())
    }

    fn handle_message(&mut self, msg: SyncMessage) -> Option<SessionUpdate> {
        if msg.peer_id == self.local().peer_id {
            return None;
        }
        let routed = !matches!(msg.msg_type, MessageType::Ping | MessageType::Pong);
        if routed && msg.doc_id != self.doc_id.as_uuid() {
            log::debug!("Ignoring {:?} for foreign channel {}", msg.msg_type, msg.doc_id);
            return None;
        }

        match msg.msg_type {
            MessageType::Delta => {
                let op = match msg.replica_op() {
                    Ok(op) => op,
                    Err(e) => {
                        log::warn!("Malformed delta from {}: {e}", msg.peer_id);
                        return None;
                    }
                };
                let outcome = self.workspace.replicas().apply_remote(self.kind, &op);
                match outcome {
                    Ok(MergeOutcome::Applied) => Some(self.text_update()),
                    // Errors were logged by the replica manager.
                    Ok(MergeOutcome::Duplicate) | Err(_) => None,
                }
            }

            MessageType::SyncStep1 => {
                let diff = self.workspace.replicas().diff_since(self.kind, &msg.payload);
                match diff {
                    Ok(diff) => {
                        self.send(SyncMessage::sync_step2(self.local().peer_id, self.doc_id, diff));
                    }
                    Err(e) => log::warn!("Bad state vector from {}: {e}", msg.peer_id),
                }
                None
            }

            MessageType::SyncStep2 => {
                let applied = self.workspace.replicas().apply_sync(self.kind, &msg.payload);
                let seeded = self.seed_pending();
                (applied.is_ok() || seeded).then(|| self.text_update())
            }

            MessageType::Awareness => {
                match msg.awareness_message() {
                    Ok(message) => {
                        if let Some(change) = self.awareness.handle_message(&message, now()) {
                            self.apply_presence(&change);
                        }
                    }
                    Err(e) => log::warn!("Malformed presence from {}: {e}", msg.peer_id),
                }
                None
            }

            MessageType::PeerJoined => {
                match msg.peer_info() {
                    Ok(info) => log::debug!("{} joined the {} channel", info.name, self.kind),
                    Err(e) => log::debug!("Join without peer info from {}: {e}", msg.peer_id),
                }
                self.announce();
                None
            }

            MessageType::PeerLeft => {
                if let Some(change) = self.awareness.remove(&msg.peer_id) {
                    self.apply_presence(&change);
                }
                None
            }

            MessageType::Ping => {
                self.send(SyncMessage::pong(self.local().peer_id));
                None
            }

            MessageType::Pong => None,

            MessageType::Resync => {
                log::info!("Missed frames on {} channel, resyncing", self.kind);
                self.announce();
                None
            }
        }
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn recv_or_pending(inbound: &mut Option<Inbound>) -> Option<SyncMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryHub;

    #[test]
    fn test_config_defaults_validate() {
        let config = SessionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.presence_timeout, Duration::from_secs(30));
        assert_eq!(config.offline_queue_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_timeout_not_above_heartbeat() {
        let config = SessionConfig {
            presence_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutNotAboveHeartbeat { .. })
        ));

        let config = SessionConfig {
            heartbeat_interval: Duration::ZERO,
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroHeartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_bad_config() {
        let hub = MemoryHub::new(16);
        let config = SessionConfig {
            offline_queue_capacity: 0,
            ..SessionConfig::default()
        };
        let result = CollabSession::open(
            Workspace::new(),
            BufferKind::Script,
            "/p",
            PeerInfo::new("Ann"),
            "",
            Box::new(hub.provider()),
            config,
        )
        .await;
        assert!(matches!(result, Err(SessionError::Config(ConfigError::ZeroQueueCapacity))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alone_on_channel_seeds_after_timeout() {
        let hub = MemoryHub::new(16);
        let workspace = Workspace::new();
        let mut session = CollabSession::open(
            workspace.clone(),
            BufferKind::Style,
            "/p",
            PeerInfo::new("Ann"),
            "p{}",
            Box::new(hub.provider()),
            SessionConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(session.text(), "");
        let _ = time::timeout(Duration::from_millis(1500), session.next_update()).await;
        assert_eq!(workspace.current_text(BufferKind::Style), "p{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_edits_queue() {
        let hub = MemoryHub::new(16);
        hub.set_reachable(false);
        let mut session = CollabSession::open(
            Workspace::new(),
            BufferKind::Markup,
            "/p",
            PeerInfo::new("Ann"),
            "<p></p>",
            Box::new(hub.provider()),
            SessionConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        session.local_edit(&TextPatch::insert(3, "hi")).unwrap();

        // seed plus edit
        assert_eq!(session.queued(), 2);
        assert_eq!(session.text(), "<p>hi</p>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_refuses_edits() {
        let hub = MemoryHub::new(16);
        let mut session = CollabSession::open(
            Workspace::new(),
            BufferKind::Script,
            "/p",
            PeerInfo::new("Ann"),
            "",
            Box::new(hub.provider()),
            SessionConfig::default(),
        )
        .await
        .unwrap();

        session.close();
        assert!(session.is_closed());
        assert!(matches!(session.edit_to("x"), Err(SessionError::Closed)));
        assert!(session.next_update().await.is_none());
    }
}

//! Presence: who is connected to a buffer right now.
//!
//! Presence travels on the same channel as replica ops but never touches
//! the replica. Every `State` broadcast is the sender's complete record
//! and simply replaces whatever was held for that participant, so
//! receiving one twice is harmless.
//!
//! ```text
//! heartbeat tick ──▸ local_state() ──▸ Awareness msg ──▸ peers
//!                                                          │
//!      evict_stale(now) ◂── last_seen ◂── handle_message ◂─┘
//!              │
//!              ▼
//!       PresenceChange ──▸ CollaboratorRegistry
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use playpen_core::BufferKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::PeerInfo;

/// Selection as `(anchor, head)` byte offsets into the buffer text.
/// A collapsed caret has `anchor == head`.
pub type Cursor = (u32, u32);

/// Stable, visually distinct `#rrggbb` colour for a participant.
///
/// Hue comes from the id; saturation and lightness are fixed so every
/// colour reads well on both light and dark panels.
pub fn participant_color(id: Uuid) -> String {
    let hue = (id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

/// `User <n>` with `n` in `0..100`.
pub fn default_display_name(id: Uuid) -> String {
    format!("User {}", id.as_u128() % 100)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full presence record of the sender.
    State {
        user_id: Uuid,
        name: String,
        color: String,
        buffer: BufferKind,
        cursor: Option<Cursor>,
    },

    /// Sender is leaving; drop its record now.
    Leave { user_id: Uuid },
}

impl AwarenessMessage {
    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::State { user_id, .. } => *user_id,
            AwarenessMessage::Leave { user_id } => *user_id,
        }
    }
}

/// A remote participant as tracked locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub buffer: BufferKind,
    pub cursor: Option<Cursor>,
    pub last_seen: Instant,
}

/// Roster delta produced by the awareness service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(Participant),
    /// Name, colour or cursor changed.
    Updated(Participant),
    /// Withdrew explicitly, or the channel reported the peer gone.
    Left(Uuid),
    /// Timed out.
    Evicted(Uuid),
}

/// Presence tracking for one buffer kind.
pub struct AwarenessService {
    local: PeerInfo,
    buffer: BufferKind,
    timeout: Duration,
    cursor: Option<Cursor>,
    peers: HashMap<Uuid, Participant>,
}

impl AwarenessService {
    pub fn new(local: PeerInfo, buffer: BufferKind, timeout: Duration) -> Self {
        Self {
            local,
            buffer,
            timeout,
            cursor: None,
            peers: HashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerInfo {
        &self.local
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Returns whether the local record changed.
    pub fn set_cursor(&mut self, cursor: Option<Cursor>) -> bool {
        if self.cursor == cursor {
            return false;
        }
        self.cursor = cursor;
        true
    }

    /// The local participant's complete record, for broadcast.
    pub fn local_state(&self) -> AwarenessMessage {
        AwarenessMessage::State {
            user_id: self.local.peer_id,
            name: self.local.name.clone(),
            color: self.local.color.clone(),
            buffer: self.buffer,
            cursor: self.cursor,
        }
    }

    /// Active withdrawal of the local participant.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local.peer_id,
        }
    }

    /// Apply a received presence message. `last_seen` is refreshed on
    /// every `State`, whether or not anything visible changed.
    pub fn handle_message(
        &mut self,
        message: &AwarenessMessage,
        now: Instant,
    ) -> Option<PresenceChange> {
        if message.user_id() == self.local.peer_id {
            return None;
        }

        match message {
            AwarenessMessage::State {
                user_id,
                name,
                color,
                buffer,
                cursor,
            } => {
                if *buffer != self.buffer {
                    log::debug!(
                        "Presence from {user_id} bound to {buffer} on the {} channel",
                        self.buffer
                    );
                    return self.remove(user_id);
                }

                let record = Participant {
                    id: *user_id,
                    name: name.clone(),
                    color: color.clone(),
                    buffer: *buffer,
                    cursor: *cursor,
                    last_seen: now,
                };
                match self.peers.insert(*user_id, record.clone()) {
                    None => {
                        log::info!("{} joined the {} buffer", record.name, self.buffer);
                        Some(PresenceChange::Joined(record))
                    }
                    Some(old)
                        if old.name != record.name
                            || old.color != record.color
                            || old.cursor != record.cursor =>
                    {
                        Some(PresenceChange::Updated(record))
                    }
                    Some(_) => {
                        log::trace!("Presence heartbeat from {user_id}");
                        None
                    }
                }
            }
            AwarenessMessage::Leave { user_id } => self.remove(user_id),
        }
    }

    /// Drop a participant the channel reported as gone.
    pub fn remove(&mut self, id: &Uuid) -> Option<PresenceChange> {
        self.peers.remove(id).map(|peer| {
            log::info!("{} left the {} buffer", peer.name, self.buffer);
            PresenceChange::Left(peer.id)
        })
    }

    /// Evict everyone not heard from within the timeout as of `now`.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<PresenceChange> {
        let timeout = self.timeout;
        let stale: Vec<Uuid> = self
            .peers
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_seen) > timeout)
            .map(|peer| peer.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(|peer| {
                log::info!(
                    "Evicting {} from the {} buffer (silent for over {:?})",
                    peer.name,
                    self.buffer,
                    timeout
                );
                PresenceChange::Evicted(peer.id)
            })
            .collect()
    }

    pub fn participant(&self, id: &Uuid) -> Option<&Participant> {
        self.peers.get(id)
    }

    /// Remote participants, ordered by name then id.
    pub fn participants(&self) -> Vec<&Participant> {
        let mut peers: Vec<_> = self.peers.values().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forget every remote participant.
    pub fn clear(&mut self) -> Vec<PresenceChange> {
        self.peers
            .drain()
            .map(|(id, _)| PresenceChange::Left(id))
            .collect()
    }
}

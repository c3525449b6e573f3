//! # playpen-collab: real-time collaboration for the Playpen editor
//!
//! Each buffer kind of a page is replicated on its own channel. Sessions
//! exchange replica ops and presence over a [`NetworkProvider`], either a
//! WebSocket connection to the relay or the in-process [`MemoryHub`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   SyncMessage    ┌─────────────┐
//! │ CollabSession│ ◄──────────────► │ SyncServer  │
//! │ (per kind)   │  bincode / WS    │ (relay)     │
//! └──────┬───────┘                  └──────┬──────┘
//!        │                                 │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌─────────────┐
//! │ Workspace    │                  │ yrs Doc     │
//! │ replicas +   │                  │ per room    │
//! │ roster       │                  └──────┬──────┘
//! └──────────────┘                         │
//!                                  ┌───────┴───────┐
//!                                  │ BroadcastGroup│
//!                                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: room fan-out with per-peer buffering
//! - [`provider`]: the `NetworkProvider` seam and `MemoryHub`
//! - [`client`]: WebSocket provider
//! - [`server`]: WebSocket relay
//! - [`presence`]: awareness records and staleness eviction
//! - [`registry`]: collaborator roster with subscriptions
//! - [`queue`]: offline op queue
//! - [`session`]: per-kind session tying it all together

pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;

pub use broadcast::{BroadcastGroup, BroadcastStats, Frame, RoomManager};
pub use client::SyncClient;
pub use presence::{AwarenessMessage, AwarenessService, Cursor, Participant, PresenceChange};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use provider::{ConnectionState, Inbound, MemoryHub, MemoryProvider, NetworkProvider};
pub use queue::OfflineQueue;
pub use registry::{Collaborator, CollaboratorRegistry, Roster, SubscriptionId};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{
    CollabSession, ConfigError, SessionConfig, SessionError, SessionUpdate, Workspace,
};

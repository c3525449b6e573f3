//! Binary protocol for replica synchronisation.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads by type:
//!
//! | Type | Payload |
//! |------|---------|
//! | `SyncStep1` | encoded yrs state vector |
//! | `SyncStep2` | yrs update holding everything the requester lacks |
//! | `Delta` | bincode [`ReplicaOp`] |
//! | `Awareness` | bincode [`AwarenessMessage`] |
//! | `PeerJoined` | bincode [`PeerInfo`] |
//! | `PeerLeft`, `Ping`, `Pong`, `Resync` | empty |
//!
//! `Resync` never crosses the wire: a provider hands it to its own session
//! when frames were lost on the way in.

use playpen_core::{DocumentId, ReplicaOp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{default_display_name, participant_color, AwarenessMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector: "send me what I am missing"
    SyncStep1 = 1,
    /// Answer to `SyncStep1`
    SyncStep2 = 2,
    /// One replica op
    Delta = 3,
    /// Presence record or withdrawal
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Inbound frames were dropped; sync again
    Resync = 9,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// `#rrggbb`, stable for a given `peer_id`
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Fresh identity with the default `User <n>` name.
    pub fn anonymous() -> Self {
        let peer_id = Uuid::new_v4();
        Self::with_id(peer_id, default_display_name(peer_id))
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: participant_color(peer_id),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender. `Uuid::nil()` when the relay itself answers.
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender's op counter for deltas, 0 otherwise
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn delta(peer_id: Uuid, doc_id: DocumentId, op: &ReplicaOp) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Delta,
            peer_id,
            doc_id: doc_id.as_uuid(),
            clock: op.version,
            payload: to_bytes(op)?,
        })
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: DocumentId, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            doc_id: doc_id.as_uuid(),
            clock: 0,
            payload: state_vector,
        }
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: DocumentId, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            doc_id: doc_id.as_uuid(),
            clock: 0,
            payload: update,
        }
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: DocumentId,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Awareness,
            peer_id,
            doc_id: doc_id.as_uuid(),
            clock: 0,
            payload: to_bytes(message)?,
        })
    }

    pub fn peer_joined(doc_id: DocumentId, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::PeerJoined,
            peer_id: info.peer_id,
            doc_id: doc_id.as_uuid(),
            clock: 0,
            payload: to_bytes(info)?,
        })
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            doc_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            doc_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Raised by a provider whose inbound side lagged.
    pub fn resync(doc_id: DocumentId) -> Self {
        Self {
            msg_type: MessageType::Resync,
            peer_id: Uuid::nil(),
            doc_id: doc_id.as_uuid(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        to_bytes(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        from_bytes(bytes)
    }

    pub fn replica_op(&self) -> Result<ReplicaOp, ProtocolError> {
        self.expect(MessageType::Delta)?;
        from_bytes(&self.payload)
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        from_bytes(&self.payload)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        from_bytes(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(())
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unexpected message type {0:?}")]
    InvalidMessageType(MessageType),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,
}

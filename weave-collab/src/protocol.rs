//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                         server
//!   │── PeerJoined ───────────────▶│
//!   │── SyncStep1(sv) ────────────▶│
//!   │── Awareness(Join) ──────────▶│
//!   │◀─────── Awareness(Join) × N ─│  cached presence of peers already here
//!   │◀──────────── SyncStep2(diff) │  client is synced after applying this
//!   │◀──────────── SyncStep1(sv)   │
//!   │── SyncStep2(diff) ──────────▶│  edits made while offline
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::RoomEvent;
use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for a diff
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental CRDT update
    Delta = 3,
    /// Presence update
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Ephemeral room event ("something changed, re-read it")
    Event = 9,
}

/// Connection identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// Display color, `#RRGGBB`
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        let color = weave_core::user_color(&name).to_string();
        Self {
            peer_id,
            name,
            color,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Opaque room partition key, e.g. `canvas-42`
    pub room_id: String,
    /// Per-connection send counter
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn with_payload(
        msg_type: MessageType,
        peer_id: Uuid,
        room_id: &str,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.to_string(),
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, room_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::with_payload(MessageType::Delta, peer_id, room_id, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room_id: &str, state_vector: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep1, peer_id, room_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room_id: &str, state_diff: Vec<u8>) -> Self {
        Self::with_payload(MessageType::SyncStep2, peer_id, room_id, 0, state_diff)
    }

    /// Create a presence message.
    pub fn awareness(
        peer_id: Uuid,
        room_id: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(message)?;
        Ok(Self::with_payload(MessageType::Awareness, peer_id, room_id, clock, payload))
    }

    /// Create a room event message.
    pub fn event(
        peer_id: Uuid,
        room_id: &str,
        clock: u64,
        event: &RoomEvent,
    ) -> Result<Self, ProtocolError> {
        let payload = encode_payload(event)?;
        Ok(Self::with_payload(MessageType::Event, peer_id, room_id, clock, payload))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(peer_id: Uuid, room_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = encode_payload(info)?;
        Ok(Self::with_payload(MessageType::PeerJoined, peer_id, room_id, 0, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room_id: &str) -> Self {
        Self::with_payload(MessageType::PeerLeft, peer_id, room_id, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::with_payload(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse presence payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse room event payload.
    pub fn room_event(&self) -> Result<RoomEvent, ProtocolError> {
        if self.msg_type != MessageType::Event {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

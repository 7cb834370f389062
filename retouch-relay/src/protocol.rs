//! JSON wire protocol for the action relay.
//!
//! Every frame is a WebSocket text message holding one JSON object
//! tagged by `"type"`:
//! ```text
//! client ─► relay   join | action | ack | resync | leave | ping
//! relay  ─► client  welcome | action | ack | resync | peer_joined
//!                   | peer_left | error | pong
//! ```
//!
//! Sequence numbers are the only ordering authority. `timestamp` is
//! informational and never used for ordering.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::RelayError;

/// Opaque session identifier supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Participant identifier, unique within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for clients that don't bring their own.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Closed set of edit intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Brush,
    Erase,
    Undo,
    Redo,
    ProviderResultApplied,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Brush,
        ActionKind::Erase,
        ActionKind::Undo,
        ActionKind::Redo,
        ActionKind::ProviderResultApplied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brush => "brush",
            Self::Erase => "erase",
            Self::Undo => "undo",
            Self::Redo => "redo",
            Self::ProviderResultApplied => "provider_result_applied",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RelayError::InvalidAction(s.to_string()))
    }
}

/// An action as submitted by a participant, before validation.
///
/// `kind` stays a plain string on the wire so that unknown kinds reach
/// the relay and are rejected there instead of killing the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    /// Resolve `kind` against the closed set.
    pub fn validate(&self) -> Result<ActionKind, RelayError> {
        self.kind.parse()
    }
}

/// A stamped, immutable edit action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub sequence: u64,
    pub origin_participant_id: ParticipantId,
    pub kind: ActionKind,
    pub payload: Value,
    /// Milliseconds since the Unix epoch, informational only
    pub timestamp: u64,
}

/// Wall-clock milliseconds for action timestamps.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Client → relay messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join (or rejoin) a session. Without a `participant` the relay
    /// assigns a fresh one and returns it in `welcome`. `last_acked`
    /// defaults to the relay's stored value for the participant.
    Join {
        session: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant: Option<ParticipantId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_acked: Option<u64>,
    },
    Action {
        kind: String,
        #[serde(default)]
        payload: Value,
    },
    Ack {
        sequence: u64,
    },
    Resync {
        last_acked: u64,
    },
    Leave,
    Ping,
}

impl ClientMessage {
    pub fn action(request: ActionRequest) -> Self {
        Self::Action {
            kind: request.kind,
            payload: request.payload,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Machine-readable error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownSession,
    UnknownParticipant,
    ResyncGap,
    DeliveryStale,
    InvalidAction,
    AckOutOfRange,
    CapacityExceeded,
    NotJoined,
    Malformed,
}

/// Relay → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session: SessionId,
        participant: ParticipantId,
        last_acked: u64,
        next_sequence: u64,
    },
    /// An action from another participant.
    Action(Action),
    /// The originator's own action, stamped with its sequence.
    Ack(Action),
    /// Replay of missed actions, ascending.
    Resync {
        actions: Vec<Action>,
    },
    PeerJoined {
        participant: ParticipantId,
    },
    PeerLeft {
        participant: ParticipantId,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        oldest_retained: Option<u64>,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            oldest_retained: None,
        }
    }

    /// Sequence number carried by action-bearing messages.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Action(a) | Self::Ack(a) => Some(a.sequence),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Transport-level protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
}

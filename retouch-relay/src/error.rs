//! Relay error taxonomy.
//!
//! Everything here is recoverable at the session/participant boundary;
//! the server turns each variant into a wire `error` frame.

use thiserror::Error;

use crate::protocol::{ErrorCode, ParticipantId, ServerMessage, SessionId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Never created, or evicted. The caller must re-join.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Participant {participant} is not a member of session {session}")]
    UnknownParticipant {
        session: SessionId,
        participant: ParticipantId,
    },

    /// Replay range starts before the oldest retained entry; the caller
    /// needs a full snapshot from the application layer.
    #[error("Resync gap: requested actions after {requested}, oldest retained is {oldest}")]
    ResyncGap { requested: u64, oldest: u64 },

    /// Outbound queue overflowed; no more fan-out until a resync.
    #[error("Participant {0} fell behind and must resync")]
    DeliveryStale(ParticipantId),

    #[error("Invalid action kind: {0:?}")]
    InvalidAction(String),

    #[error("Sequence {sequence} is beyond the session head {head}")]
    AckOutOfRange { sequence: u64, head: u64 },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
}

impl RelayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::UnknownParticipant { .. } => ErrorCode::UnknownParticipant,
            Self::ResyncGap { .. } => ErrorCode::ResyncGap,
            Self::DeliveryStale(_) => ErrorCode::DeliveryStale,
            Self::InvalidAction(_) => ErrorCode::InvalidAction,
            Self::AckOutOfRange { .. } => ErrorCode::AckOutOfRange,
            Self::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
        }
    }

    /// Wire form of this error.
    pub fn to_message(&self) -> ServerMessage {
        let oldest_retained = match self {
            Self::ResyncGap { oldest, .. } => Some(*oldest),
            _ => None,
        };
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            oldest_retained,
        }
    }
}

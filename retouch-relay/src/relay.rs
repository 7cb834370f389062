//! Action relay: validate, order, log and fan out.

use std::sync::Arc;

use crate::error::RelayError;
use crate::protocol::{Action, ActionRequest, ParticipantId, SessionId};
use crate::registry::SessionRegistry;

/// Entry point for inbound actions.
///
/// The relay itself is stateless; ordering lives in each session's
/// critical section.
#[derive(Clone)]
pub struct ActionRelay {
    registry: Arc<SessionRegistry>,
}

impl ActionRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stamp `request` with the session's next sequence, append it to the
    /// log and fan it out. The returned action is the originator's ack.
    ///
    /// Unknown kinds are rejected before a sequence is allocated, so the
    /// log only ever holds well-formed actions and has no holes.
    pub async fn submit(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
        request: ActionRequest,
    ) -> Result<Arc<Action>, RelayError> {
        let session = self.registry.get(session_id).await?;
        let kind = request.validate().inspect_err(|e| {
            log::debug!("Rejected action from {participant} in {session_id}: {e}");
        })?;
        session.publish(participant, kind, request.payload).await
    }

    /// Record a participant's ack.
    pub async fn acknowledge(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
        sequence: u64,
    ) -> Result<u64, RelayError> {
        let session = self.registry.get(session_id).await?;
        session.acknowledge(participant, sequence).await
    }
}

//! Reconnect coordination: replay missed actions from the log.
//!
//! A reconnecting participant tells the relay the highest sequence it
//! has applied. It gets back everything after that, in order, followed
//! by live fan-out on a fresh queue. If the log no longer reaches back
//! that far the participant gets `ResyncGap` and has to rebuild from a
//! full snapshot held by the application layer.

use std::sync::Arc;

use crate::action_log::Replay;
use crate::broadcast::Inbox;
use crate::error::RelayError;
use crate::protocol::{ParticipantId, SessionId};
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct ReconnectCoordinator {
    registry: Arc<SessionRegistry>,
    queue_capacity: usize,
}

impl ReconnectCoordinator {
    /// `queue_capacity` bounds each participant's outbound queue.
    pub fn new(registry: Arc<SessionRegistry>, queue_capacity: usize) -> Self {
        Self {
            registry,
            queue_capacity,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Actions after `last_acked`, ascending. Side-effect free; the same
    /// call returns the same range as long as the log still holds it.
    pub async fn resync(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
        last_acked: u64,
    ) -> Result<Replay, RelayError> {
        let session = self.registry.get(session_id).await?;
        session.replay_for(participant, last_acked).await
    }

    /// Replay plus a live queue, attached atomically. Clears a stale flag.
    pub async fn reconnect(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
        last_acked: u64,
    ) -> Result<(Replay, Inbox), RelayError> {
        let session = self.registry.get(session_id).await?;
        match session.attach(participant, last_acked, self.queue_capacity).await {
            Ok((replay, inbox)) => {
                log::debug!(
                    "Participant {participant} resynced in {session_id}: {} actions after {last_acked}",
                    replay.total()
                );
                Ok((replay, inbox))
            }
            Err(e) => {
                log::warn!("Resync for {participant} in {session_id} failed: {e}");
                Err(e)
            }
        }
    }
}

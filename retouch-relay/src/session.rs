//! A live editing session and its ordering authority.
//!
//! All mutable session state sits behind one async mutex. Sequence
//! allocation, log append and fan-out happen inside that critical
//! section, which is what gives every participant the same total order.
//! Fan-out only ever does non-blocking pushes, so the section stays short.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::action_log::{ActionLog, LogStats, Replay};
use crate::broadcast::{self, DeliveryCounters, DeliveryStats, Inbox, Outbound, Outbox, PushError};
use crate::error::RelayError;
use crate::protocol::{now_millis, Action, ActionKind, ParticipantId, ServerMessage, SessionId};
use crate::sequence::SequenceAllocator;

/// One member of a session.
#[derive(Debug)]
struct Participant {
    id: ParticipantId,
    /// Highest sequence the participant confirmed
    last_acked: u64,
    /// Present while a connection is attached and keeping up
    outbox: Option<Outbox>,
    stale: bool,
    /// Set when the connection dropped without an explicit leave
    disconnected_at: Option<Instant>,
}

impl Participant {
    fn new(id: ParticipantId) -> Self {
        Self {
            id,
            last_acked: 0,
            outbox: None,
            stale: false,
            disconnected_at: Some(Instant::now()),
        }
    }

    /// Push onto the participant's queue; overflow or a dead queue
    /// detaches it.
    fn deliver(&mut self, msg: Outbound) -> Result<(), RelayError> {
        let Some(outbox) = self.outbox.as_ref() else {
            return Err(RelayError::DeliveryStale(self.id.clone()));
        };
        match outbox.push(msg) {
            Ok(()) => Ok(()),
            Err(PushError::Full) => {
                self.outbox = None;
                self.stale = true;
                Err(RelayError::DeliveryStale(self.id.clone()))
            }
            Err(PushError::Closed) => {
                self.outbox = None;
                self.disconnected_at = Some(Instant::now());
                Err(RelayError::DeliveryStale(self.id.clone()))
            }
        }
    }
}

/// Point-in-time view of a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub id: ParticipantId,
    pub last_acked: u64,
    pub connected: bool,
    pub stale: bool,
}

/// Result of admitting a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub last_acked: u64,
    /// True when the participant was already a member
    pub rejoined: bool,
}

#[derive(Debug)]
struct SessionState {
    log: ActionLog,
    participants: HashMap<ParticipantId, Participant>,
    /// Set while the session has no members
    idle_since: Option<Instant>,
}

impl SessionState {
    fn member_mut(
        &mut self,
        session: &SessionId,
        participant: &ParticipantId,
    ) -> Result<&mut Participant, RelayError> {
        self.participants
            .get_mut(participant)
            .ok_or_else(|| RelayError::UnknownParticipant {
                session: session.clone(),
                participant: participant.clone(),
            })
    }

    /// Trim up to the lowest ack among members. With no members nothing
    /// is trimmed, so a quick rejoin can still replay.
    fn trim_log(&mut self) -> usize {
        match self.participants.values().map(|p| p.last_acked).min() {
            Some(min_acked) => self.log.trim(min_acked),
            None => 0,
        }
    }
}

/// A logical shared editing room.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    sequencer: SequenceAllocator,
    state: Mutex<SessionState>,
    counters: DeliveryCounters,
}

impl Session {
    pub fn new(id: SessionId, log_capacity: usize) -> Self {
        Self {
            id,
            sequencer: SequenceAllocator::new(),
            state: Mutex::new(SessionState {
                log: ActionLog::new(log_capacity),
                participants: HashMap::new(),
                idle_since: Some(Instant::now()),
            }),
            counters: DeliveryCounters::default(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Sequence the next action will receive.
    pub fn next_sequence(&self) -> u64 {
        self.sequencer.peek()
    }

    /// Admit a participant. Rejoining is a no-op that returns the
    /// participant's stored state.
    pub async fn join(
        &self,
        participant: &ParticipantId,
        max_participants: usize,
    ) -> Result<JoinOutcome, RelayError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.participants.get(participant) {
            return Ok(JoinOutcome {
                last_acked: existing.last_acked,
                rejoined: true,
            });
        }
        if state.participants.len() >= max_participants {
            return Err(RelayError::CapacityExceeded(format!(
                "session {} is full ({max_participants} participants)",
                self.id
            )));
        }

        state
            .participants
            .insert(participant.clone(), Participant::new(participant.clone()));
        state.idle_since = None;
        Ok(JoinOutcome {
            last_acked: 0,
            rejoined: false,
        })
    }

    /// Remove a participant. Returns true when the session became empty.
    pub async fn leave(&self, participant: &ParticipantId) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        if state.participants.remove(participant).is_none() {
            return Err(RelayError::UnknownParticipant {
                session: self.id.clone(),
                participant: participant.clone(),
            });
        }
        state.trim_log();

        let empty = state.participants.is_empty();
        if empty {
            state.idle_since = Some(Instant::now());
        }
        Ok(empty)
    }

    /// Detach a participant's connection without removing it, keeping
    /// its place (and its ack) for a reconnect. Returns false when the
    /// participant has already attached a newer, still open queue.
    pub async fn disconnect(&self, participant: &ParticipantId) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        let member = state.member_mut(&self.id, participant)?;
        if member.outbox.as_ref().is_some_and(|outbox| !outbox.is_closed()) {
            return Ok(false);
        }
        member.outbox = None;
        member.disconnected_at = Some(Instant::now());
        Ok(true)
    }

    /// Stamp, log and fan out one action. The originator receives an
    /// `ack` through its own queue; everyone else receives `action`.
    pub async fn publish(
        &self,
        origin: &ParticipantId,
        kind: ActionKind,
        payload: Value,
    ) -> Result<Arc<Action>, RelayError> {
        let mut state = self.state.lock().await;
        state.member_mut(&self.id, origin)?;

        let action = Arc::new(Action {
            sequence: self.sequencer.next_sequence(),
            origin_participant_id: origin.clone(),
            kind,
            payload,
            timestamp: now_millis(),
        });
        state.log.append(action.clone());

        let broadcast: Outbound = Arc::new(ServerMessage::Action(Action::clone(&action)));
        let ack: Outbound = Arc::new(ServerMessage::Ack(Action::clone(&action)));

        for member in state.participants.values_mut() {
            let was_stale = member.stale;
            let msg = if member.id == *origin { ack.clone() } else { broadcast.clone() };
            match member.deliver(msg) {
                Ok(()) => self.counters.record_sent(),
                Err(e) => {
                    self.counters.record_missed();
                    if member.stale && !was_stale {
                        self.counters.record_stale();
                        log::warn!("Session {}: {e} (at sequence {})", self.id, action.sequence);
                    }
                }
            }
        }

        state.trim_log();
        log::trace!(
            "Session {}: {} #{} from {}",
            self.id,
            action.kind,
            action.sequence,
            origin
        );
        Ok(action)
    }

    /// Record that `participant` has applied everything up to `sequence`.
    /// Acks never move backwards. Returns the stored value.
    pub async fn acknowledge(
        &self,
        participant: &ParticipantId,
        sequence: u64,
    ) -> Result<u64, RelayError> {
        let head = self.sequencer.head();
        if sequence > head {
            return Err(RelayError::AckOutOfRange { sequence, head });
        }

        let mut state = self.state.lock().await;
        let member = state.member_mut(&self.id, participant)?;
        member.last_acked = member.last_acked.max(sequence);
        let acked = member.last_acked;
        state.trim_log();
        Ok(acked)
    }

    /// Entries after `last_acked` for a member. Read-only and repeatable.
    pub async fn replay_for(
        &self,
        participant: &ParticipantId,
        last_acked: u64,
    ) -> Result<Replay, RelayError> {
        let mut state = self.state.lock().await;
        state.member_mut(&self.id, participant)?;
        state.log.replay_after(last_acked)
    }

    /// Attach a fresh outbound queue and compute the catch-up replay in
    /// one step, so nothing slips between the replay and live fan-out.
    /// Any previous queue for the participant is dropped.
    pub async fn attach(
        &self,
        participant: &ParticipantId,
        last_acked: u64,
        capacity: usize,
    ) -> Result<(Replay, Inbox), RelayError> {
        let mut state = self.state.lock().await;
        let replay = {
            state.member_mut(&self.id, participant)?;
            state.log.replay_after(last_acked)?
        };

        let (outbox, inbox) = broadcast::channel(capacity);
        let member = state.member_mut(&self.id, participant)?;
        member.outbox = Some(outbox);
        member.stale = false;
        member.disconnected_at = None;
        member.last_acked = member.last_acked.max(last_acked);
        Ok((replay, inbox))
    }

    /// Fan out a non-logged notice (presence) to everyone but `except`.
    pub async fn announce(&self, msg: ServerMessage, except: &ParticipantId) -> usize {
        let msg: Outbound = Arc::new(msg);
        let mut state = self.state.lock().await;
        let mut delivered = 0;
        for member in state.participants.values_mut() {
            if member.id == *except || member.outbox.is_none() {
                continue;
            }
            if member.deliver(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove members whose connection has been gone longer than
    /// `timeout`. Returns the removed ids.
    pub async fn reap_disconnected(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let mut state = self.state.lock().await;
        let expired: Vec<ParticipantId> = state
            .participants
            .values()
            .filter(|p| {
                p.disconnected_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|p| p.id.clone())
            .collect();

        for id in &expired {
            state.participants.remove(id);
        }
        if !expired.is_empty() {
            state.trim_log();
            if state.participants.is_empty() {
                state.idle_since = Some(now);
            }
        }
        expired
    }

    /// True when the session has had no members for at least `timeout`.
    pub async fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        let state = self.state.lock().await;
        state.participants.is_empty()
            && state
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
    }

    pub async fn participants(&self) -> Vec<ParticipantSnapshot> {
        let state = self.state.lock().await;
        let mut out: Vec<ParticipantSnapshot> = state
            .participants
            .values()
            .map(|p| ParticipantSnapshot {
                id: p.id.clone(),
                last_acked: p.last_acked,
                connected: p.outbox.is_some(),
                stale: p.stale,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn participant(&self, id: &ParticipantId) -> Option<ParticipantSnapshot> {
        self.participants().await.into_iter().find(|p| p.id == *id)
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }

    pub async fn log_stats(&self) -> LogStats {
        self.state.lock().await.log.stats()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.counters.snapshot()
    }
}

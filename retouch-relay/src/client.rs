//! WebSocket relay client.
//!
//! Provides:
//! - Connection lifecycle (connect, leave, reconnect with `last_acked`)
//! - An idempotent replica log that applies each sequence exactly once
//! - Automatic acks for applied actions
//! - Offline queue for actions submitted while disconnected
//!
//! Reconciliation after a reconnect: the relay replays everything after
//! our `last_applied`. Own actions in that replay settle the oldest
//! pending submissions; whatever is still pending afterwards never
//! reached the relay and is resent ahead of the offline queue.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    Action, ActionKind, ActionRequest, ClientMessage, ErrorCode, ParticipantId, ProtocolError,
    ServerMessage, SessionId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the relay client, in the order actions must be
/// applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Socket established
    Connected,
    /// Socket lost
    Disconnected,
    /// The relay accepted our join
    Joined { last_acked: u64, next_sequence: u64 },
    /// Another participant's action, ready to apply
    RemoteAction(Action),
    /// One of our own actions, now stamped with its sequence
    Acknowledged(Action),
    /// A resync finished; `applied` actions were new
    Resynced { applied: usize },
    PeerJoined(ParticipantId),
    PeerLeft(ParticipantId),
    /// The relay no longer holds the actions we need. Restore a snapshot
    /// and call [`RelayClient::resync_from`].
    ResyncGap { oldest_retained: u64 },
    Error { code: ErrorCode, message: String },
}

/// Result of offering a sequence to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already applied; ignore
    Duplicate,
    /// Something is missing before this sequence
    Gap { expected: u64, got: u64 },
}

/// Tracks which sequences this replica has applied.
#[derive(Debug, Clone, Default)]
pub struct ReplicaLog {
    last_applied: u64,
    applied: u64,
}

impl ReplicaLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, sequence: u64) -> ApplyOutcome {
        let expected = self.last_applied + 1;
        if sequence < expected {
            ApplyOutcome::Duplicate
        } else if sequence > expected {
            ApplyOutcome::Gap {
                expected,
                got: sequence,
            }
        } else {
            self.last_applied = sequence;
            self.applied += 1;
            ApplyOutcome::Applied
        }
    }

    /// Highest contiguous sequence applied.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Actions applied through this log.
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    /// Jump to `sequence` after restoring an external snapshot.
    pub fn reset_to(&mut self, sequence: u64) {
        self.last_applied = sequence;
    }
}

/// Offline queue for actions submitted while disconnected.
///
/// Queued actions are sent, in order, once the relay has caught us up.
pub struct OfflineQueue {
    queue: VecDeque<ActionRequest>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an action. Returns false when full.
    pub fn enqueue(&mut self, request: ActionRequest) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(request);
        true
    }

    /// Put unconfirmed actions back in front of anything queued later.
    /// These were already accepted once, so the size cap doesn't apply.
    pub fn requeue_front(&mut self, requests: impl DoubleEndedIterator<Item = ActionRequest>) {
        for request in requests.rev() {
            self.queue.push_front(request);
        }
    }

    pub fn drain(&mut self) -> Vec<ActionRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// What one inbound message asks of the client.
#[derive(Debug, Default, PartialEq)]
struct Reaction {
    replies: Vec<ClientMessage>,
    events: Vec<RelayEvent>,
}

/// Replica state shared between the API and the reader task.
struct ClientState {
    replica: ReplicaLog,
    /// Sent but not yet seen stamped, oldest first
    pending: VecDeque<ActionRequest>,
    offline: OfflineQueue,
    joined: bool,
    /// Between `welcome` and the catch-up `resync`
    awaiting_catch_up: bool,
    resync_requested: bool,
}

impl ClientState {
    fn new(offline_capacity: usize) -> Self {
        Self {
            replica: ReplicaLog::new(),
            pending: VecDeque::new(),
            offline: OfflineQueue::new(offline_capacity),
            joined: false,
            awaiting_catch_up: false,
            resync_requested: false,
        }
    }

    /// Can submissions go straight to the relay?
    fn is_live(&self) -> bool {
        self.joined && !self.awaiting_catch_up
    }

    fn request_resync(&mut self, reaction: &mut Reaction) {
        if !self.resync_requested {
            self.resync_requested = true;
            reaction.replies.push(ClientMessage::Resync {
                last_acked: self.replica.last_applied(),
            });
        }
    }

    /// Apply one stamped action. Returns false on a gap.
    fn apply(&mut self, me: &ParticipantId, action: Action, reaction: &mut Reaction) -> bool {
        match self.replica.apply(action.sequence) {
            ApplyOutcome::Applied => {
                if action.origin_participant_id == *me {
                    self.pending.pop_front();
                    reaction.events.push(RelayEvent::Acknowledged(action));
                } else {
                    reaction.events.push(RelayEvent::RemoteAction(action));
                }
                true
            }
            ApplyOutcome::Duplicate => true,
            ApplyOutcome::Gap { expected, got } => {
                log::debug!("Gap in action stream: expected {expected}, got {got}");
                self.request_resync(reaction);
                false
            }
        }
    }

    fn on_message(&mut self, me: &ParticipantId, msg: ServerMessage) -> Reaction {
        let mut reaction = Reaction::default();
        let before = self.replica.last_applied();

        match msg {
            ServerMessage::Welcome {
                last_acked,
                next_sequence,
                ..
            } => {
                self.joined = true;
                self.awaiting_catch_up = true;
                reaction.events.push(RelayEvent::Joined {
                    last_acked,
                    next_sequence,
                });
            }
            ServerMessage::Resync { actions } => {
                self.resync_requested = false;
                let start = self.replica.last_applied();
                for action in actions {
                    if !self.apply(me, action, &mut reaction) {
                        break;
                    }
                }
                let applied = (self.replica.last_applied() - start) as usize;

                if self.awaiting_catch_up {
                    self.awaiting_catch_up = false;
                    // Still pending after catch-up means never received
                    let unsent: Vec<ActionRequest> = self.pending.drain(..).collect();
                    self.offline.requeue_front(unsent.into_iter());
                    let queued = self.offline.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued actions", queued.len());
                    }
                    for request in queued {
                        reaction.replies.push(ClientMessage::action(request.clone()));
                        self.pending.push_back(request);
                    }
                }
                reaction.events.push(RelayEvent::Resynced { applied });
            }
            ServerMessage::Action(action) | ServerMessage::Ack(action) => {
                self.apply(me, action, &mut reaction);
            }
            ServerMessage::PeerJoined { participant } => {
                reaction.events.push(RelayEvent::PeerJoined(participant));
            }
            ServerMessage::PeerLeft { participant } => {
                reaction.events.push(RelayEvent::PeerLeft(participant));
            }
            ServerMessage::Error {
                code: ErrorCode::DeliveryStale,
                ..
            } => {
                log::warn!("Relay marked us stale, resyncing");
                self.request_resync(&mut reaction);
            }
            ServerMessage::Error {
                code: ErrorCode::ResyncGap,
                oldest_retained,
                ..
            } => {
                self.resync_requested = false;
                reaction.events.push(RelayEvent::ResyncGap {
                    oldest_retained: oldest_retained.unwrap_or(0),
                });
            }
            ServerMessage::Error { code, message, .. } => {
                log::warn!("Relay error {code:?}: {message}");
                // A rejected resync must not block the next one
                self.resync_requested = false;
                reaction.events.push(RelayEvent::Error { code, message });
            }
            ServerMessage::Pong => {}
        }

        // Ack everything applied in one go
        let after = self.replica.last_applied();
        if after > before {
            // Acks go first so the relay can trim before our resends land
            reaction
                .replies
                .insert(0, ClientMessage::Ack { sequence: after });
        }
        reaction
    }
}

/// The relay client.
///
/// Manages a WebSocket connection to the relay, applies the ordered
/// action stream and queues submissions while offline.
pub struct RelayClient {
    session: SessionId,
    participant: ParticipantId,

    state: Arc<RwLock<ConnectionState>>,

    shared: Arc<Mutex<ClientState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<RelayEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<RelayEvent>,

    server_url: String,
}

impl RelayClient {
    pub fn new(
        session: impl Into<SessionId>,
        participant: impl Into<ParticipantId>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            session: session.into(),
            participant: participant.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shared: Arc::new(Mutex::new(ClientState::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RelayEvent>> {
        self.event_rx.take()
    }

    /// Connect and join, asking for everything after our last applied
    /// sequence.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    /// Calling this again after a disconnect reconnects.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            *state = match *state {
                ConnectionState::Disconnected if self.outgoing_tx.is_some() => {
                    ConnectionState::Reconnecting
                }
                _ => ConnectionState::Connecting,
            };
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = {
            let mut shared = self.shared.lock().await;
            shared.joined = false;
            shared.awaiting_catch_up = false;
            shared.resync_requested = false;
            ClientMessage::Join {
                session: self.session.clone(),
                participant: Some(self.participant.clone()),
                last_acked: Some(shared.replica.last_applied()),
            }
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(RelayEvent::Connected).await;

        // Reader task: apply inbound messages, reply through the writer
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let shared = self.shared.clone();
        let me = self.participant.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let server_msg = match ServerMessage::decode(text.as_str()) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Ignoring undecodable relay message: {e}");
                                continue;
                            }
                        };

                        let reaction = shared.lock().await.on_message(&me, server_msg);
                        for reply in reaction.replies {
                            match reply.encode() {
                                Ok(text) => {
                                    if out_tx.send(text).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::error!("Failed to encode reply: {e}"),
                            }
                        }
                        for event in reaction.events {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            shared.lock().await.joined = false;
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit an action. While offline (or still catching up) it is
    /// queued and sent after the next catch-up.
    pub async fn submit(&self, kind: ActionKind, payload: Value) -> Result<(), ProtocolError> {
        let request = ActionRequest::new(kind, payload);
        let mut shared = self.shared.lock().await;

        let tx = match &self.outgoing_tx {
            Some(tx) if shared.is_live() => tx,
            _ => {
                if !shared.offline.enqueue(request) {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Ok(());
            }
        };

        let encoded = ClientMessage::action(request.clone()).encode()?;
        shared.pending.push_back(request);
        if tx.send(encoded).await.is_err() {
            // Writer is gone; keep the action for the next connection
            if let Some(request) = shared.pending.pop_back() {
                shared.offline.enqueue(request);
            }
        }
        Ok(())
    }

    /// Continue from an externally restored snapshot at `sequence`
    /// (after a [`RelayEvent::ResyncGap`]).
    pub async fn resync_from(&self, sequence: u64) -> Result<(), ProtocolError> {
        let msg = {
            let mut shared = self.shared.lock().await;
            shared.replica.reset_to(sequence);
            if shared.joined {
                shared.resync_requested = true;
                ClientMessage::Resync {
                    last_acked: sequence,
                }
            } else {
                ClientMessage::Join {
                    session: self.session.clone(),
                    participant: Some(self.participant.clone()),
                    last_acked: Some(sequence),
                }
            }
        };
        self.send(msg).await
    }

    /// Leave the session for good.
    pub async fn leave(&mut self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Leave).await?;
        self.outgoing_tx = None;
        self.shared.lock().await.joined = false;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Highest sequence applied locally.
    pub async fn last_applied(&self) -> u64 {
        self.shared.lock().await.replica.last_applied()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.shared.lock().await.offline.len()
    }

    /// Sent actions not yet confirmed.
    pub async fn pending_len(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

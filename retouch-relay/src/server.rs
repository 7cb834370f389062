//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── ActionLog (replay)
//!            ├── Session (id) ── publish()
//! Client B ──┘        │              └── Outbox per participant
//!                     │                        │
//!          ┌──────────┼───────────┐            │ mpsc (bounded)
//!          ▼          ▼           ▼            ▼
//!       Client A   Client B    Client C    connection task
//! ```
//!
//! One task per connection. The task decodes JSON frames, drives the
//! registry/relay/coordinator, and forwards whatever lands in its
//! participant's inbox. A participant that falls behind gets a
//! `delivery_stale` error once its queue drains and is expected to send
//! `resync`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{Delivery, Inbox};
use crate::error::RelayError;
use crate::protocol::{ActionRequest, ClientMessage, ErrorCode, ParticipantId, ServerMessage, SessionId};
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::relay::ActionRelay;
use crate::resync::ReconnectCoordinator;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Outbound queue capacity per participant
    pub outbound_capacity: usize,
    /// How often the reaper sweeps idle sessions, in seconds
    pub reaper_interval_secs: u64,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            outbound_capacity: 256,
            reaper_interval_secs: 10,
            registry: RegistryConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    /// `delivery_stale` notices sent to lagging participants
    pub stale_notices: u64,
}

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    relay: ActionRelay,
    coordinator: ReconnectCoordinator,
    stats: Arc<RwLock<ServerStats>>,
}

/// The relay server.
pub struct RelayServer {
    shared: Shared,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.registry.clone()));
        let shared = Shared {
            relay: ActionRelay::new(registry.clone()),
            coordinator: ReconnectCoordinator::new(registry.clone(), config.outbound_capacity),
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            config,
        };
        Self { shared }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener. Also runs the
    /// idle-session reaper for as long as it serves.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        // Stops the reaper on error and when the caller drops this future
        let _reaper = AbortOnDrop(
            self.shared
                .registry
                .spawn_reaper(Duration::from_secs(self.shared.config.reaper_interval_secs.max(1))),
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// Aborts a background task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// What the connection loop should do after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection protocol state.
struct Connection {
    shared: Shared,
    member: Option<(SessionId, ParticipantId)>,
    inbox: Option<Inbox>,
    /// Replies produced by the last message, flushed in order
    outgoing: Vec<ServerMessage>,
}

impl Connection {
    fn new(shared: Shared) -> Self {
        Self {
            shared,
            member: None,
            inbox: None,
            outgoing: Vec::new(),
        }
    }

    fn member(&self) -> Result<(SessionId, ParticipantId), ServerMessage> {
        self.member
            .clone()
            .ok_or_else(|| ServerMessage::error(ErrorCode::NotJoined, "join a session first"))
    }

    async fn handle(&mut self, msg: ClientMessage) -> Flow {
        let result = match msg {
            ClientMessage::Join {
                session,
                participant,
                last_acked,
            } => self.join(session, participant, last_acked).await,
            ClientMessage::Action { kind, payload } => {
                self.submit(ActionRequest { kind, payload }).await
            }
            ClientMessage::Ack { sequence } => self.acknowledge(sequence).await,
            ClientMessage::Resync { last_acked } => self.resync(last_acked).await,
            ClientMessage::Leave => return self.leave().await,
            ClientMessage::Ping => {
                self.outgoing.push(ServerMessage::Pong);
                Ok(())
            }
        };
        if let Err(reply) = result {
            self.outgoing.push(reply);
        }
        Flow::Continue
    }

    async fn join(
        &mut self,
        session: SessionId,
        participant: Option<ParticipantId>,
        last_acked: Option<u64>,
    ) -> Result<(), ServerMessage> {
        if let Some((current, me)) = &self.member {
            return Err(ServerMessage::error(
                ErrorCode::Malformed,
                format!("already joined {current} as {me}"),
            ));
        }
        let participant = participant.unwrap_or_else(ParticipantId::random);

        let membership = self
            .shared
            .registry
            .create_or_join(&session, &participant)
            .await
            .map_err(|e| e.to_message())?;
        let last_acked = last_acked.unwrap_or(membership.last_acked);

        let (replay, inbox) = match self
            .shared
            .coordinator
            .reconnect(&session, &participant, last_acked)
            .await
        {
            Ok(attached) => attached,
            Err(e) => {
                // A fresh member that can't be caught up shouldn't pin the log
                if !membership.rejoined {
                    let _ = self.shared.registry.leave(&session, &participant).await;
                }
                return Err(e.to_message());
            }
        };

        self.outgoing.push(ServerMessage::Welcome {
            session: session.clone(),
            participant: participant.clone(),
            last_acked,
            next_sequence: membership.session.next_sequence(),
        });
        self.outgoing.push(ServerMessage::Resync {
            actions: replay.to_actions(),
        });
        membership
            .session
            .announce(
                ServerMessage::PeerJoined {
                    participant: participant.clone(),
                },
                &participant,
            )
            .await;

        self.inbox = Some(inbox);
        self.member = Some((session, participant));
        Ok(())
    }

    async fn submit(&mut self, request: ActionRequest) -> Result<(), ServerMessage> {
        let (session, participant) = self.member()?;
        // The stamped action comes back as `ack` through the inbox
        self.shared
            .relay
            .submit(&session, &participant, request)
            .await
            .map(|_| ())
            .map_err(|e| e.to_message())
    }

    async fn acknowledge(&mut self, sequence: u64) -> Result<(), ServerMessage> {
        let (session, participant) = self.member()?;
        self.shared
            .relay
            .acknowledge(&session, &participant, sequence)
            .await
            .map(|_| ())
            .map_err(|e| e.to_message())
    }

    async fn resync(&mut self, last_acked: u64) -> Result<(), ServerMessage> {
        let (session, participant) = self.member()?;
        let (replay, inbox) = self
            .shared
            .coordinator
            .reconnect(&session, &participant, last_acked)
            .await
            .map_err(|e| e.to_message())?;
        self.inbox = Some(inbox);
        self.outgoing.push(ServerMessage::Resync {
            actions: replay.to_actions(),
        });
        Ok(())
    }

    async fn leave(&mut self) -> Flow {
        let Some((session, participant)) = self.member.take() else {
            self.outgoing
                .push(ServerMessage::error(ErrorCode::NotJoined, "join a session first"));
            return Flow::Continue;
        };
        self.inbox = None;
        if let Err(e) = self.shared.registry.leave(&session, &participant).await {
            log::debug!("Leave from {participant} in {session}: {e}");
            return Flow::Close;
        }
        self.announce_left(&session, &participant).await;
        Flow::Close
    }

    /// Connection dropped without a leave: keep the membership for a
    /// reconnect.
    async fn disconnect(&mut self) {
        if let Some((session, participant)) = self.member.take() {
            self.inbox = None;
            match self.shared.registry.disconnect(&session, &participant).await {
                Ok(true) => self.announce_left(&session, &participant).await,
                Ok(false) => {}
                // Session may already be evicted
                Err(e) => log::debug!("Disconnect of {participant} from {session}: {e}"),
            }
        }
    }

    async fn announce_left(&self, session: &SessionId, participant: &ParticipantId) {
        if let Ok(live) = self.shared.registry.get(session).await {
            live.announce(
                ServerMessage::PeerLeft {
                    participant: participant.clone(),
                },
                participant,
            )
            .await;
        }
    }

    /// Translate an inbox delivery into an outbound frame, if any.
    async fn on_delivery(&mut self, delivery: Option<Delivery>) -> Option<String> {
        match delivery {
            Some(Delivery::Message(msg)) => match msg.encode() {
                Ok(text) => Some(text),
                Err(e) => {
                    log::error!("Failed to encode outbound message: {e}");
                    None
                }
            },
            Some(Delivery::Stale) => {
                self.inbox = None;
                self.shared.stats.write().await.stale_notices += 1;
                let stale = match &self.member {
                    Some((_, participant)) => RelayError::DeliveryStale(participant.clone()),
                    None => return None,
                };
                log::warn!("{stale}");
                stale.to_message().encode().ok()
            }
            None => {
                // Queue replaced by a newer attach, or the session is gone
                self.inbox = None;
                None
            }
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let heartbeat_every = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    let stats = shared.stats.clone();
    let mut conn = Connection::new(shared);

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }

                            let flow = match ClientMessage::decode(text.as_str()) {
                                Ok(client_msg) => {
                                    log::trace!("{addr} -> {client_msg:?}");
                                    conn.handle(client_msg).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    stats.write().await.malformed_messages += 1;
                                    conn.outgoing.push(ServerMessage::error(ErrorCode::Malformed, e.to_string()));
                                    Flow::Continue
                                }
                            };

                            for reply in conn.outgoing.drain(..) {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                            if flow == Flow::Close {
                                ws_sender.send(Message::Close(None)).await?;
                                break;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            stats.write().await.malformed_messages += 1;
                            let reply = ServerMessage::error(ErrorCode::Malformed, "expected a JSON text frame");
                            ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outbound fan-out for this participant
                delivery = async {
                    if let Some(ref mut inbox) = conn.inbox {
                        inbox.recv().await
                    } else {
                        // Not attached yet, wait forever
                        std::future::pending().await
                    }
                } => {
                    if let Some(text) = conn.on_delivery(delivery).await {
                        ws_sender.send(Message::Text(text.into())).await?;
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_every * 3 {
                        log::warn!("Peer {addr} missed heartbeats, closing");
                        break;
                    }
                    ws_sender.send(Message::Ping(Vec::<u8>::new().into())).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    conn.disconnect().await;
    stats.write().await.active_connections -= 1;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ActionKind;
    use serde_json::json;

    fn connection() -> Connection {
        let server = RelayServer::with_defaults();
        Connection::new(server.shared.clone())
    }

    fn join(session: &str, participant: &str) -> ClientMessage {
        ClientMessage::Join {
            session: session.into(),
            participant: Some(participant.into()),
            last_acked: None,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.registry.log_capacity, 10_000);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.registry().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_replies_welcome_then_resync() {
        let mut conn = connection();
        assert_eq!(conn.handle(join("s1", "a")).await, Flow::Continue);

        assert_eq!(conn.outgoing.len(), 2);
        assert_eq!(
            conn.outgoing[0],
            ServerMessage::Welcome {
                session: "s1".into(),
                participant: "a".into(),
                last_acked: 0,
                next_sequence: 1,
            }
        );
        assert_eq!(conn.outgoing[1], ServerMessage::Resync { actions: vec![] });
        assert!(conn.inbox.is_some());
    }

    #[tokio::test]
    async fn test_action_before_join() {
        let mut conn = connection();
        conn.handle(ClientMessage::action(ActionRequest::new(ActionKind::Brush, json!({}))))
            .await;
        assert!(matches!(
            conn.outgoing.pop(),
            Some(ServerMessage::Error { code: ErrorCode::NotJoined, .. })
        ));
    }

    #[tokio::test]
    async fn test_ack_arrives_through_inbox() {
        let mut conn = connection();
        conn.handle(join("s1", "a")).await;
        conn.outgoing.clear();

        conn.handle(ClientMessage::action(ActionRequest::new(ActionKind::Erase, json!({"r": 4}))))
            .await;
        assert!(conn.outgoing.is_empty());

        let delivery = conn.inbox.as_mut().unwrap().recv().await;
        let text = conn.on_delivery(delivery).await.unwrap();
        match ServerMessage::decode(&text).unwrap() {
            ServerMessage::Ack(action) => {
                assert_eq!(action.sequence, 1);
                assert_eq!(action.kind, ActionKind::Erase);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_action_reports_error() {
        let mut conn = connection();
        conn.handle(join("s1", "a")).await;
        conn.outgoing.clear();

        conn.handle(ClientMessage::Action { kind: "smudge".into(), payload: json!(null) })
            .await;
        assert!(matches!(
            conn.outgoing.pop(),
            Some(ServerMessage::Error { code: ErrorCode::InvalidAction, .. })
        ));
    }

    #[tokio::test]
    async fn test_leave_closes() {
        let mut conn = connection();
        conn.handle(join("s1", "a")).await;
        assert_eq!(conn.handle(ClientMessage::Leave).await, Flow::Close);
        assert!(conn.member.is_none());
        let session = conn.shared.registry.get(&"s1".into()).await.unwrap();
        assert_eq!(session.participant_count().await, 0);
    }

    #[tokio::test]
    async fn test_resync_past_any_sequence() {
        let mut conn = connection();
        conn.handle(join("s1", "a")).await;
        conn.outgoing.clear();

        assert_eq!(
            conn.handle(ClientMessage::Resync { last_acked: u64::MAX }).await,
            Flow::Continue
        );
        assert!(matches!(
            conn.outgoing.pop(),
            Some(ServerMessage::Error { code: ErrorCode::AckOutOfRange, .. })
        ));
    }

    #[tokio::test]
    async fn test_join_past_any_sequence() {
        let mut conn = connection();
        conn.handle(ClientMessage::Join {
            session: "s1".into(),
            participant: Some("a".into()),
            last_acked: Some(u64::MAX),
        })
        .await;

        assert!(matches!(
            conn.outgoing.as_slice(),
            [ServerMessage::Error { code: ErrorCode::AckOutOfRange, .. }]
        ));
        assert!(conn.member.is_none());
        let session = conn.shared.registry.get(&"s1".into()).await.unwrap();
        assert_eq!(session.participant_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_assigns_participant_id() {
        let mut conn = connection();
        conn.handle(ClientMessage::Join {
            session: "s1".into(),
            participant: None,
            last_acked: None,
        })
        .await;

        let assigned = match &conn.outgoing[0] {
            ServerMessage::Welcome { participant, .. } => participant.clone(),
            other => panic!("expected welcome, got {other:?}"),
        };
        assert!(!assigned.as_str().is_empty());
        assert_eq!(conn.member, Some(("s1".into(), assigned.clone())));

        let session = conn.shared.registry.get(&"s1".into()).await.unwrap();
        assert!(session.participant(&assigned).await.is_some());
    }

    #[tokio::test]
    async fn test_dropping_serve_stops_reaper() {
        let server = RelayServer::with_defaults();
        let baseline = Arc::strong_count(server.registry());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::time::timeout(Duration::from_millis(50), server.serve(listener)).await;
        assert!(serving.is_err());

        // The aborted reaper releases its registry handle
        for _ in 0..100 {
            if Arc::strong_count(server.registry()) == baseline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(Arc::strong_count(server.registry()), baseline);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut conn = connection();
        conn.handle(ClientMessage::Ping).await;
        assert_eq!(conn.outgoing, vec![ServerMessage::Pong]);
    }
}

//! Integration tests for the WebSocket relay.
//!
//! These tests start a real server and connect real sockets, verifying
//! the full join → submit → fan-out → resync pipeline.

use futures_util::{SinkExt, StreamExt};
use retouch_relay::client::{ConnectionState, RelayClient, RelayEvent};
use retouch_relay::protocol::{
    Action, ActionKind, ActionRequest, ClientMessage, ErrorCode, ServerMessage,
};
use retouch_relay::server::{RelayServer, ServerConfig};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        outbound_capacity: 64,
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://127.0.0.1:{port}")
}

async fn open(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return ServerMessage::decode(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

/// Next message that isn't presence.
async fn recv_relevant(ws: &mut Ws) -> ServerMessage {
    loop {
        match recv(ws).await {
            ServerMessage::PeerJoined { .. } | ServerMessage::PeerLeft { .. } => continue,
            msg => return msg,
        }
    }
}

/// Join and consume the welcome + catch-up pair, returning the replay.
async fn join(ws: &mut Ws, session: &str, participant: &str, last_acked: Option<u64>) -> Vec<Action> {
    send(
        ws,
        ClientMessage::Join {
            session: session.into(),
            participant: Some(participant.into()),
            last_acked,
        },
    )
    .await;
    match recv_relevant(ws).await {
        ServerMessage::Welcome { participant: p, .. } => assert_eq!(p.as_str(), participant),
        other => panic!("expected welcome, got {other:?}"),
    }
    match recv_relevant(ws).await {
        ServerMessage::Resync { actions } => actions,
        other => panic!("expected resync, got {other:?}"),
    }
}

fn brush(n: u64) -> ClientMessage {
    ClientMessage::action(ActionRequest::new(ActionKind::Brush, json!({ "n": n })))
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_first_action_reaches_peer_and_origin() {
    let url = start_test_server().await;
    let mut p1 = open(&url).await;
    let mut p2 = open(&url).await;
    assert!(join(&mut p1, "s1", "p1", None).await.is_empty());
    assert!(join(&mut p2, "s1", "p2", None).await.is_empty());

    send(&mut p1, ClientMessage::action(ActionRequest::new(ActionKind::Brush, json!({"x": 1, "y": 1})))).await;

    match recv_relevant(&mut p2).await {
        ServerMessage::Action(action) => {
            assert_eq!(action.sequence, 1);
            assert_eq!(action.origin_participant_id.as_str(), "p1");
            assert_eq!(action.payload, json!({"x": 1, "y": 1}));
        }
        other => panic!("expected action, got {other:?}"),
    }
    send(&mut p2, ClientMessage::Ack { sequence: 1 }).await;

    match recv_relevant(&mut p1).await {
        ServerMessage::Ack(action) => assert_eq!(action.sequence, 1),
        other => panic!("expected ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_peer_presence() {
    let url = start_test_server().await;
    let mut p1 = open(&url).await;
    let mut p2 = open(&url).await;
    join(&mut p1, "s1", "p1", None).await;
    join(&mut p2, "s1", "p2", None).await;

    assert_eq!(
        recv(&mut p1).await,
        ServerMessage::PeerJoined { participant: "p2".into() }
    );

    send(&mut p2, ClientMessage::Leave).await;
    assert_eq!(
        recv(&mut p1).await,
        ServerMessage::PeerLeft { participant: "p2".into() }
    );
}

#[tokio::test]
async fn test_reconnect_replays_missed_actions() {
    let url = start_test_server().await;
    let mut p1 = open(&url).await;
    let mut p2 = open(&url).await;
    join(&mut p1, "s1", "p1", None).await;
    join(&mut p2, "s1", "p2", None).await;

    for n in 1..=3 {
        send(&mut p1, brush(n)).await;
    }
    for expected in 1..=3 {
        assert_eq!(recv_relevant(&mut p2).await.sequence(), Some(expected));
    }
    send(&mut p2, ClientMessage::Ack { sequence: 3 }).await;
    p2.close(None).await.unwrap();

    send(&mut p1, brush(4)).await;
    send(&mut p1, brush(5)).await;
    for expected in 1..=5 {
        assert_eq!(recv_relevant(&mut p1).await.sequence(), Some(expected));
    }

    let mut p2 = open(&url).await;
    let replay = join(&mut p2, "s1", "p2", Some(3)).await;
    let sequences: Vec<u64> = replay.iter().map(|a| a.sequence).collect();
    assert_eq!(sequences, vec![4, 5]);

    // Live delivery resumes after the replay
    send(&mut p1, brush(6)).await;
    assert_eq!(recv_relevant(&mut p2).await.sequence(), Some(6));
}

#[tokio::test]
async fn test_resync_request_is_repeatable() {
    let url = start_test_server().await;
    let mut ws = open(&url).await;
    join(&mut ws, "s1", "p1", None).await;
    for n in 1..=4 {
        send(&mut ws, brush(n)).await;
    }
    for _ in 1..=4 {
        recv_relevant(&mut ws).await;
    }

    for _ in 0..2 {
        send(&mut ws, ClientMessage::Resync { last_acked: 1 }).await;
        match recv_relevant(&mut ws).await {
            ServerMessage::Resync { actions } => {
                let sequences: Vec<u64> = actions.iter().map(|a| a.sequence).collect();
                assert_eq!(sequences, vec![2, 3, 4]);
            }
            other => panic!("expected resync, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_errors_are_reported_not_fatal() {
    let url = start_test_server().await;
    let mut ws = open(&url).await;

    send(&mut ws, brush(1)).await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::Error { code: ErrorCode::NotJoined, .. }
    ));

    ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::Error { code: ErrorCode::Malformed, .. }
    ));

    join(&mut ws, "s1", "p1", None).await;
    send(&mut ws, ClientMessage::Action { kind: "smudge".into(), payload: json!({}) }).await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::Error { code: ErrorCode::InvalidAction, .. }
    ));

    send(&mut ws, ClientMessage::Ack { sequence: 7 }).await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerMessage::Error { code: ErrorCode::AckOutOfRange, .. }
    ));

    // The connection still works and the rejected action used no sequence
    send(&mut ws, brush(1)).await;
    assert_eq!(recv(&mut ws).await.sequence(), Some(1));

    send(&mut ws, ClientMessage::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::Pong);
}

/// Collect applied actions from a client's events until `count` arrive.
async fn applied_actions(
    rx: &mut tokio::sync::mpsc::Receiver<RelayEvent>,
    count: usize,
) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    while out.len() < count {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for actions")
            .expect("event channel closed");
        match event {
            RelayEvent::RemoteAction(a) | RelayEvent::Acknowledged(a) => {
                out.push((a.sequence, a.origin_participant_id.to_string()));
            }
            _ => {}
        }
    }
    out
}

#[tokio::test]
async fn test_clients_converge_on_one_order() {
    let url = start_test_server().await;
    let mut alice = RelayClient::new("s1", "alice", url.as_str());
    let mut bob = RelayClient::new("s1", "bob", url.as_str());
    let mut alice_rx = alice.take_event_rx().unwrap();
    let mut bob_rx = bob.take_event_rx().unwrap();

    alice.connect().await.unwrap();
    bob.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    let a = tokio::spawn(async move {
        for n in 0..20 {
            alice.submit(ActionKind::Brush, json!({ "n": n })).await.unwrap();
        }
        alice
    });
    let b = tokio::spawn(async move {
        for n in 0..20 {
            bob.submit(ActionKind::Erase, json!({ "n": n })).await.unwrap();
        }
        bob
    });
    let _alice = a.await.unwrap();
    let _bob = b.await.unwrap();

    let seen_by_alice = applied_actions(&mut alice_rx, 40).await;
    let seen_by_bob = applied_actions(&mut bob_rx, 40).await;

    assert_eq!(seen_by_alice, seen_by_bob);
    let sequences: Vec<u64> = seen_by_alice.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, (1..=40).collect::<Vec<u64>>());
    assert_eq!(seen_by_alice.iter().filter(|(_, o)| o == "alice").count(), 20);
}

#[tokio::test]
async fn test_offline_submissions_flush_on_connect() {
    let url = start_test_server().await;
    let mut observer = open(&url).await;
    join(&mut observer, "s1", "observer", None).await;

    let mut client = RelayClient::new("s1", "late", url.as_str());
    client.submit(ActionKind::Brush, json!({"n": 1})).await.unwrap();
    client.submit(ActionKind::Undo, json!(null)).await.unwrap();
    assert_eq!(client.offline_queue_len().await, 2);

    client.connect().await.unwrap();

    let first = recv_relevant(&mut observer).await;
    let second = recv_relevant(&mut observer).await;
    match (first, second) {
        (ServerMessage::Action(a), ServerMessage::Action(b)) => {
            assert_eq!((a.sequence, a.kind), (1, ActionKind::Brush));
            assert_eq!((b.sequence, b.kind), (2, ActionKind::Undo));
        }
        other => panic!("expected two actions, got {other:?}"),
    }
    assert_eq!(client.offline_queue_len().await, 0);
}

//! Relay-level integration tests: ordering, replay and backpressure
//! exercised through the public API without sockets.

use std::collections::HashMap;
use std::sync::Arc;

use retouch_relay::{
    Action, ActionKind, ActionRelay, ActionRequest, Delivery, Inbox, ParticipantId,
    ReconnectCoordinator, RegistryConfig, RelayError, ReplicaLog, ServerMessage, SessionId,
    SessionRegistry,
};
use serde_json::json;
use tokio::time::{timeout, Duration};

struct Harness {
    registry: Arc<SessionRegistry>,
    relay: ActionRelay,
    coordinator: ReconnectCoordinator,
}

fn harness(log_capacity: usize, queue_capacity: usize) -> Harness {
    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        log_capacity,
        ..RegistryConfig::default()
    }));
    Harness {
        relay: ActionRelay::new(registry.clone()),
        coordinator: ReconnectCoordinator::new(registry.clone(), queue_capacity),
        registry,
    }
}

impl Harness {
    async fn connect(&self, session: &SessionId, participant: &ParticipantId) -> Inbox {
        let membership = self.registry.create_or_join(session, participant).await.unwrap();
        let (_, inbox) = self
            .coordinator
            .reconnect(session, participant, membership.last_acked)
            .await
            .unwrap();
        inbox
    }
}

fn request(n: u64) -> ActionRequest {
    ActionRequest::new(ActionKind::Brush, json!({ "n": n }))
}

/// Pull `count` action-bearing messages from an inbox.
async fn drain(inbox: &mut Inbox, count: usize) -> Vec<Action> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let delivery = timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("timed out")
            .expect("inbox closed");
        match delivery {
            Delivery::Message(msg) => match &*msg {
                ServerMessage::Action(a) | ServerMessage::Ack(a) => out.push(a.clone()),
                _ => {}
            },
            Delivery::Stale => panic!("unexpected stale"),
        }
    }
    out
}

#[tokio::test]
async fn test_total_order_across_participants_and_sessions() {
    let h = Arc::new(harness(10_000, 4096));
    let sessions: Vec<SessionId> = vec!["left".into(), "right".into()];
    let people: Vec<ParticipantId> = vec!["a".into(), "b".into(), "c".into()];

    let mut inboxes = HashMap::new();
    for s in &sessions {
        for p in &people {
            inboxes.insert((s.clone(), p.clone()), h.connect(s, p).await);
        }
    }

    let mut tasks = Vec::new();
    for s in &sessions {
        for p in &people {
            let (h, s, p) = (h.clone(), s.clone(), p.clone());
            tasks.push(tokio::spawn(async move {
                for n in 0..100 {
                    h.relay.submit(&s, &p, request(n)).await.unwrap();
                }
            }));
        }
    }
    for t in tasks {
        t.await.unwrap();
    }

    for s in &sessions {
        let mut reference: Option<Vec<(u64, ParticipantId)>> = None;
        for p in &people {
            let inbox = inboxes.get_mut(&(s.clone(), p.clone())).unwrap();
            let seen: Vec<(u64, ParticipantId)> = drain(inbox, 300)
                .await
                .into_iter()
                .map(|a| (a.sequence, a.origin_participant_id))
                .collect();

            let sequences: Vec<u64> = seen.iter().map(|(seq, _)| *seq).collect();
            assert_eq!(sequences, (1..=300).collect::<Vec<u64>>());
            match &reference {
                Some(r) => assert_eq!(&seen, r),
                None => reference = Some(seen),
            }
        }
    }
}

#[tokio::test]
async fn test_apply_is_idempotent_under_redelivery() {
    let h = harness(1000, 64);
    let s: SessionId = "s".into();
    let (writer, reader): (ParticipantId, ParticipantId) = ("w".into(), "r".into());
    h.connect(&s, &writer).await;
    let mut inbox = h.connect(&s, &reader).await;

    for n in 1..=5 {
        h.relay.submit(&s, &writer, request(n)).await.unwrap();
    }
    let live = drain(&mut inbox, 5).await;

    // Reconnect from 2 and see 3..=5 again on top of live delivery
    let (replay, _inbox) = h.coordinator.reconnect(&s, &reader, 2).await.unwrap();

    let mut replica = ReplicaLog::new();
    let mut applied = Vec::new();
    for action in live.iter().cloned().chain(replay.map(|a| Action::clone(&a))) {
        if replica.apply(action.sequence) == retouch_relay::ApplyOutcome::Applied {
            applied.push(action.sequence);
        }
    }
    assert_eq!(applied, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_resync_completeness() {
    let h = harness(1000, 64);
    let s: SessionId = "s".into();
    let p: ParticipantId = "p".into();
    h.connect(&s, &p).await;
    for n in 1..=20 {
        h.relay.submit(&s, &p, request(n)).await.unwrap();
    }

    for k in [0u64, 1, 10, 19, 20] {
        let replay = h.coordinator.resync(&s, &p, k).await.unwrap();
        assert_eq!(replay.sequences(), ((k + 1)..=20).collect::<Vec<u64>>());
    }
    assert!(matches!(
        h.coordinator.resync(&s, &p, 21).await,
        Err(RelayError::AckOutOfRange { sequence: 21, head: 20 })
    ));
}

#[tokio::test]
async fn test_trimmed_log_reports_gap() {
    let h = harness(10, 64);
    let s: SessionId = "s".into();
    let p: ParticipantId = "p".into();
    h.connect(&s, &p).await;

    for n in 1..=59 {
        let action = h.relay.submit(&s, &p, request(n)).await.unwrap();
        h.relay.acknowledge(&s, &p, action.sequence).await.unwrap();
    }

    let err = h.coordinator.resync(&s, &p, 0).await.unwrap_err();
    assert_eq!(err, RelayError::ResyncGap { requested: 0, oldest: 50 });
    match err.to_message() {
        ServerMessage::Error { oldest_retained, .. } => assert_eq!(oldest_retained, Some(50)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_participant_goes_stale_and_recovers() {
    let h = harness(1000, 4);
    let s: SessionId = "s".into();
    let (fast, slow): (ParticipantId, ParticipantId) = ("fast".into(), "slow".into());
    let mut fast_inbox = h.connect(&s, &fast).await;
    let mut slow_inbox = h.connect(&s, &slow).await;

    // The fast participant keeps reading; the slow one doesn't
    for n in 1..=10 {
        h.relay.submit(&s, &fast, request(n)).await.unwrap();
        drain(&mut fast_inbox, 1).await;
    }

    let mut received = Vec::new();
    loop {
        match slow_inbox.recv().await {
            Some(Delivery::Message(msg)) => received.extend(msg.sequence()),
            Some(Delivery::Stale) => break,
            None => panic!("inbox closed without a stale signal"),
        }
    }
    assert_eq!(received, vec![1, 2, 3, 4]);

    let session = h.registry.get(&s).await.unwrap();
    assert!(session.participant(&slow).await.unwrap().stale);
    assert!(session.delivery_stats().messages_missed >= 6);

    let (replay, mut slow_inbox) = h.coordinator.reconnect(&s, &slow, 4).await.unwrap();
    assert_eq!(replay.sequences(), (5..=10).collect::<Vec<u64>>());

    h.relay.submit(&s, &fast, request(11)).await.unwrap();
    assert_eq!(drain(&mut slow_inbox, 1).await[0].sequence, 11);
}

//! Session registry: maps session ids to live sessions.
//!
//! Sessions are created on first join and evicted by the reaper once
//! they have had no members for `idle_timeout`. Lifecycle changes are
//! logged and published on a broadcast channel for anyone observing
//! the relay (metrics exporters, admin tooling, tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::protocol::{ParticipantId, SessionId};
use crate::session::Session;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an empty session survives before eviction
    pub idle_timeout: Duration,
    /// How long a member may stay disconnected before it is removed
    pub participant_timeout: Duration,
    /// Soft cap on retained log entries per session
    pub log_capacity: usize,
    pub max_sessions: usize,
    pub max_participants_per_session: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            participant_timeout: Duration::from_secs(120),
            log_capacity: 10_000,
            max_sessions: 10_000,
            max_participants_per_session: 100,
        }
    }
}

/// Observable lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    SessionCreated(SessionId),
    SessionEvicted(SessionId),
    ParticipantJoined {
        session: SessionId,
        participant: ParticipantId,
    },
    ParticipantLeft {
        session: SessionId,
        participant: ParticipantId,
    },
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub live_participants: usize,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
}

/// What `create_or_join` hands back.
#[derive(Debug, Clone)]
pub struct Membership {
    pub session: Arc<Session>,
    pub last_acked: u64,
    pub rejoined: bool,
}

pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    events: broadcast::Sender<RegistryEvent>,
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            events,
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create the session if needed and admit the participant.
    ///
    /// The join runs while the map lock is held so the reaper can never
    /// evict a session between lookup and admission.
    pub async fn create_or_join(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<Membership, RelayError> {
        let max = self.config.max_participants_per_session;

        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(session_id) {
                let outcome = session.join(participant, max).await?;
                let membership = Membership {
                    session: session.clone(),
                    last_acked: outcome.last_acked,
                    rejoined: outcome.rejoined,
                };
                drop(sessions);
                self.joined(session_id, participant, membership.rejoined);
                return Ok(membership);
            }
        }

        // Slow path: write lock to create
        let mut sessions = self.sessions.write().await;
        let created = !sessions.contains_key(session_id);
        if created && sessions.len() >= self.config.max_sessions {
            return Err(RelayError::CapacityExceeded(format!(
                "session limit reached ({})",
                self.config.max_sessions
            )));
        }
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Session::new(session_id.clone(), self.config.log_capacity)))
            .clone();

        let outcome = match session.join(participant, max).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if created {
                    sessions.remove(session_id);
                }
                return Err(e);
            }
        };
        drop(sessions);

        if created {
            self.sessions_created.fetch_add(1, Ordering::Relaxed);
            log::info!("Session {session_id} created");
            self.emit(RegistryEvent::SessionCreated(session_id.clone()));
        }
        self.joined(session_id, participant, outcome.rejoined);

        Ok(Membership {
            session,
            last_acked: outcome.last_acked,
            rejoined: outcome.rejoined,
        })
    }

    fn joined(&self, session_id: &SessionId, participant: &ParticipantId, rejoined: bool) {
        if rejoined {
            log::debug!("Participant {participant} rejoined session {session_id}");
            return;
        }
        log::info!("Participant {participant} joined session {session_id}");
        self.emit(RegistryEvent::ParticipantJoined {
            session: session_id.clone(),
            participant: participant.clone(),
        });
    }

    pub async fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, RelayError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::UnknownSession(session_id.clone()))
    }

    /// Explicit leave. The last member leaving starts the idle clock; the
    /// log stays until the reaper evicts the session.
    pub async fn leave(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<(), RelayError> {
        let session = self.get(session_id).await?;
        let empty = session.leave(participant).await?;

        log::info!("Participant {participant} left session {session_id}");
        self.emit(RegistryEvent::ParticipantLeft {
            session: session_id.clone(),
            participant: participant.clone(),
        });
        if empty {
            log::info!(
                "Session {session_id} is empty, evicting in {:?} unless rejoined",
                self.config.idle_timeout
            );
        }
        Ok(())
    }

    /// Connection lost without a leave. Returns false if the participant
    /// had already reconnected elsewhere.
    pub async fn disconnect(
        &self,
        session_id: &SessionId,
        participant: &ParticipantId,
    ) -> Result<bool, RelayError> {
        let session = self.get(session_id).await?;
        let detached = session.disconnect(participant).await?;
        if detached {
            log::debug!("Participant {participant} disconnected from session {session_id}");
        }
        Ok(detached)
    }

    /// Drop members disconnected past `participant_timeout`, then evict
    /// sessions idle past `idle_timeout`. Returns the evicted ids.
    pub async fn evict_idle(&self, now: Instant) -> Vec<SessionId> {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in &snapshot {
            for participant in session
                .reap_disconnected(now, self.config.participant_timeout)
                .await
            {
                log::info!(
                    "Participant {participant} timed out of session {}",
                    session.id()
                );
                self.emit(RegistryEvent::ParticipantLeft {
                    session: session.id().clone(),
                    participant,
                });
            }
        }

        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();
        for (id, session) in sessions.iter() {
            if session.is_expired(now, self.config.idle_timeout).await {
                evicted.push(id.clone());
            }
        }
        for id in &evicted {
            sessions.remove(id);
        }
        drop(sessions);

        for id in &evicted {
            self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
            log::info!("Session {id} evicted (idle)");
            self.emit(RegistryEvent::SessionEvicted(id.clone()));
        }
        evicted
    }

    /// Run `evict_idle` every `interval` until the returned handle is
    /// aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(Instant::now()).await;
                if !evicted.is_empty() {
                    log::debug!("Reaper evicted {} sessions", evicted.len());
                }
            }
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut live_participants = 0;
        for session in &sessions {
            live_participants += session.participant_count().await;
        }
        RegistryStats {
            live_sessions: sessions.len(),
            live_participants,
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
        }
    }
}

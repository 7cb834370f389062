//! # retouch-relay: Real-time action relay for shared retouching sessions
//!
//! Participants of a session submit edit actions; the relay stamps each
//! with a per-session sequence number, keeps it in a bounded replay log,
//! and fans it out so every participant applies the same actions in the
//! same order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RelayClient │ ◄─────────────────► │ RelayServer │
//! │ (per user)  │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                    ┌────────────────┐
//! │ ReplicaLog  │                    │ SessionRegistry│
//! │ (applied ≤n)│                    └───────┬────────┘
//! └─────────────┘                            │
//!                              ┌─────────────┼──────────────┐
//!                              ▼             ▼              ▼
//!                      SequenceAllocator  ActionLog   Outbox/Inbox
//!                        (per session)    (replay)    (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and identifiers
//! - [`sequence`]: Per-session sequence allocation
//! - [`action_log`]: Bounded replay log
//! - [`broadcast`]: Bounded per-participant fan-out queues
//! - [`session`]: Session state and its ordering critical section
//! - [`registry`]: Session lifecycle and idle eviction
//! - [`relay`]: Submit/acknowledge entry point
//! - [`resync`]: Replay for reconnecting participants
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket client with replica log and offline queue

pub mod action_log;
pub mod broadcast;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod resync;
pub mod sequence;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use action_log::{ActionLog, LogStats, Replay};
pub use broadcast::{Delivery, DeliveryStats, Inbox, Outbox};
pub use client::{ApplyOutcome, ConnectionState, OfflineQueue, RelayClient, RelayEvent, ReplicaLog};
pub use error::RelayError;
pub use protocol::{
    Action, ActionKind, ActionRequest, ClientMessage, ErrorCode, ParticipantId, ProtocolError,
    ServerMessage, SessionId,
};
pub use registry::{Membership, RegistryConfig, RegistryEvent, RegistryStats, SessionRegistry};
pub use relay::ActionRelay;
pub use resync::ReconnectCoordinator;
pub use sequence::SequenceAllocator;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use session::{JoinOutcome, ParticipantSnapshot, Session};

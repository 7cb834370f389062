//! Fan-out to N-1 participants with bounded per-participant queues.
//!
//! Every connected participant owns an [`Outbox`] (held by the session)
//! and an [`Inbox`] (held by its connection task). Pushing never blocks:
//! a full queue marks the participant stale and closes the queue, so one
//! slow reader can't hold up `submit()` for everyone else.
//!
//! ```text
//!              ┌─► Outbox(p2) ──mpsc(cap)──► Inbox(p2) ─► socket
//! publish() ───┼─► Outbox(p3) ──mpsc(cap)──► Inbox(p3) ─► socket
//!              └─► Outbox(p1)  (ack to originator)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// Messages are encoded once per fan-out and shared between queues.
pub type Outbound = Arc<ServerMessage>;

/// Why a push did not land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue at capacity; the participant is now stale.
    Full,
    /// Receiving side is gone (connection closed or replaced).
    Closed,
}

/// Session-side half of a participant's outbound queue.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    stale: Arc<AtomicBool>,
}

/// Connection-side half of a participant's outbound queue.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Outbound>,
    stale: Arc<AtomicBool>,
    stale_reported: bool,
}

/// What an [`Inbox`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Message(Outbound),
    /// The queue overflowed; everything already queued has been drained
    /// and the participant must resync.
    Stale,
}

/// Create a connected outbox/inbox pair holding up to `capacity` messages.
pub fn channel(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stale = Arc::new(AtomicBool::new(false));
    (
        Outbox {
            tx,
            stale: stale.clone(),
        },
        Inbox {
            rx,
            stale,
            stale_reported: false,
        },
    )
}

impl Outbox {
    /// Queue a message without waiting.
    ///
    /// On overflow the outbox flags itself stale; the caller should drop
    /// it so the inbox drains and then reports [`Delivery::Stale`].
    pub fn push(&self, msg: Outbound) -> Result<(), PushError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stale.store(true, Ordering::SeqCst);
                Err(PushError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Inbox {
    /// Next delivery, or `None` once the outbox is gone for good.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Some(msg) => Some(Delivery::Message(msg)),
            None if self.stale.load(Ordering::SeqCst) && !self.stale_reported => {
                self.stale_reported = true;
                Some(Delivery::Stale)
            }
            None => None,
        }
    }
}

/// Delivery counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub messages_sent: u64,
    /// Deliveries skipped because the participant was stale or offline
    pub messages_missed: u64,
    /// Times a participant was marked stale
    pub stale_marks: u64,
}

/// Atomic delivery counters, lock-free on the hot path.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    messages_sent: AtomicU64,
    messages_missed: AtomicU64,
    stale_marks: AtomicU64,
}

impl DeliveryCounters {
    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missed(&self) {
        self.messages_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_marks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_missed: self.messages_missed.load(Ordering::Relaxed),
            stale_marks: self.stale_marks.load(Ordering::Relaxed),
        }
    }
}

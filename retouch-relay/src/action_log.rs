//! Bounded, append-only replay log for a session.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ActionLog                     │
//! │                                              │
//! │  base ─► [ 50 | 51 | 52 | ... | head ]       │
//! │          ▲                                   │
//! │          └─ trimmed only once every member   │
//! │             has acked past it                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The log is the source of truth for replay. `capacity` is a soft cap:
//! entries beyond it are dropped oldest-first, but never while some
//! member of the session still needs them.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::RelayError;
use crate::protocol::Action;

/// Statistics for a replay log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Entries currently retained
    pub retained: usize,
    /// Entries dropped by trimming since creation
    pub trimmed: u64,
    /// Sequence of the oldest retained entry (or the next one to arrive)
    pub oldest_retained: u64,
    /// Highest sequence appended (0 if none)
    pub head: u64,
}

#[derive(Debug)]
pub struct ActionLog {
    entries: VecDeque<Arc<Action>>,
    /// Sequence of `entries[0]`, or of the next append when empty
    base: u64,
    capacity: usize,
    trimmed: u64,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            base: 1,
            capacity,
            trimmed: 0,
        }
    }

    /// Append the next action. Sequences must arrive contiguously.
    pub fn append(&mut self, action: Arc<Action>) {
        debug_assert_eq!(action.sequence, self.base + self.entries.len() as u64);
        self.entries.push_back(action);
    }

    /// Drop entries over capacity whose sequence is at or below
    /// `min_acked`. Returns how many were dropped.
    pub fn trim(&mut self, min_acked: u64) -> usize {
        let mut dropped = 0;
        while self.entries.len() > self.capacity {
            match self.entries.front() {
                Some(front) if front.sequence <= min_acked => {
                    self.entries.pop_front();
                    self.base += 1;
                    dropped += 1;
                }
                _ => break,
            }
        }
        self.trimmed += dropped as u64;
        dropped
    }

    /// All entries with sequence > `last_acked`, ascending.
    pub fn replay_after(&self, last_acked: u64) -> Result<Replay, RelayError> {
        let head = self.head();
        if last_acked > head {
            return Err(RelayError::AckOutOfRange {
                sequence: last_acked,
                head,
            });
        }
        // `base` is at least 1, so the subtraction never wraps
        if last_acked < self.base - 1 {
            return Err(RelayError::ResyncGap {
                requested: last_acked,
                oldest: self.base,
            });
        }

        let skip = (last_acked - (self.base - 1)) as usize;
        Ok(Replay::new(self.entries.iter().skip(skip).cloned().collect()))
    }

    /// Sequence of the oldest retained entry, or of the next append when
    /// the log is empty.
    pub fn oldest_retained(&self) -> u64 {
        self.base
    }

    /// Highest sequence appended so far (0 if none).
    pub fn head(&self) -> u64 {
        self.base + self.entries.len() as u64 - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            retained: self.entries.len(),
            trimmed: self.trimmed,
            oldest_retained: self.base,
            head: self.head(),
        }
    }
}

/// A finite replay of log entries.
///
/// Holds its own snapshot of the range, so it stays valid after the
/// session lock is released. Cloning or [`Replay::restart`] iterates the
/// same range again.
#[derive(Debug, Clone)]
pub struct Replay {
    actions: Arc<[Arc<Action>]>,
    pos: usize,
}

impl Replay {
    fn new(actions: Vec<Arc<Action>>) -> Self {
        Self {
            actions: actions.into(),
            pos: 0,
        }
    }

    /// Rewind to the first entry.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    /// Total entries in the range, regardless of position.
    pub fn total(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Sequence numbers in the range.
    pub fn sequences(&self) -> Vec<u64> {
        self.actions.iter().map(|a| a.sequence).collect()
    }

    /// Owned copies of the whole range, for the wire.
    pub fn to_actions(&self) -> Vec<Action> {
        self.actions.iter().map(|a| Action::clone(a)).collect()
    }
}

impl Iterator for Replay {
    type Item = Arc<Action>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.actions.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.actions.len() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Replay {}

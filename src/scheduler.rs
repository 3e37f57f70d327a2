//! Expiry schedule for time-bounded punishments
//!
//! A single binary heap ordered by deadline, guarded by a plain mutex,
//! plus a live-set map keyed by (guild, user, kind). Heap entries are
//! validated against the live set on pop, which makes cancellation O(1)
//! and idempotent without ever removing from the heap: a cancelled or
//! superseded entry simply goes stale and is discarded when it surfaces.
//!
//! The waiting side lives in the engine's expiry task; this module is
//! the pure data structure so the timing races stay testable.

use crate::cases::CaseKind;
use chrono::{DateTime, Utc};
use derive_more::Display;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, PoisonError};

/// Kinds of punishment the scheduler can reverse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PunishmentKind {
    #[display("ban")]
    Ban,
    #[display("timeout")]
    Timeout,
}

impl PunishmentKind {
    #[must_use]
    pub fn from_case(kind: CaseKind) -> Option<Self> {
        match kind {
            CaseKind::Ban => Some(Self::Ban),
            CaseKind::Timeout => Some(Self::Timeout),
            _ => None,
        }
    }

    #[must_use]
    pub fn case_kind(self) -> CaseKind {
        match self {
            Self::Ban => CaseKind::Ban,
            Self::Timeout => CaseKind::Timeout,
        }
    }

    #[must_use]
    pub fn reversal_kind(self) -> CaseKind {
        match self {
            Self::Ban => CaseKind::Unban,
            Self::Timeout => CaseKind::Untimeout,
        }
    }
}

/// One pending reversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledExpiry {
    pub expires_at: DateTime<Utc>,
    pub guild_id: u64,
    pub user_id: u64,
    pub kind: PunishmentKind,
    /// The punishment case this entry will reverse
    pub case_id: u64,
}

impl ScheduledExpiry {
    fn key(&self) -> (u64, u64, PunishmentKind) {
        (self.guild_id, self.user_id, self.kind)
    }
}

impl Ord for ScheduledExpiry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then_with(|| self.guild_id.cmp(&other.guild_id))
            .then_with(|| self.case_id.cmp(&other.case_id))
    }
}

impl PartialOrd for ScheduledExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Command messages for the engine's expiry task
#[derive(Debug, Clone, Copy)]
pub enum ExpiryCommand {
    /// A deadline changed; re-arm the wait
    Recheck,
    /// Stop the task
    Shutdown,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<ScheduledExpiry>>,
    live: HashMap<(u64, u64, PunishmentKind), u64>,
}

impl Queue {
    fn is_live(&self, entry: &ScheduledExpiry) -> bool {
        self.live.get(&entry.key()) == Some(&entry.case_id)
    }

    fn drop_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Time-ordered set of pending expiries
#[derive(Default)]
pub struct ExpirySchedule {
    inner: Mutex<Queue>,
}

impl ExpirySchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry, replacing any live entry for the same
    /// (guild, user, kind). Returns true when the new deadline is
    /// earlier than every other pending one, meaning the waiting task
    /// must re-arm.
    pub fn insert(&self, entry: ScheduledExpiry) -> bool {
        let mut queue = self.lock();
        queue.drop_stale_head();
        let preempts = queue
            .heap
            .peek()
            .is_none_or(|Reverse(head)| entry.expires_at < head.expires_at);
        queue.live.insert(entry.key(), entry.case_id);
        queue.heap.push(Reverse(entry));
        preempts
    }

    /// Remove the live entry for (guild, user, kind). Idempotent:
    /// cancelling an entry that already fired or was already cancelled
    /// returns false and changes nothing.
    pub fn cancel(&self, guild_id: u64, user_id: u64, kind: PunishmentKind) -> bool {
        let mut queue = self.lock();
        queue.live.remove(&(guild_id, user_id, kind)).is_some()
    }

    /// Earliest pending deadline, if any
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let mut queue = self.lock();
        queue.drop_stale_head();
        queue.heap.peek().map(|Reverse(head)| head.expires_at)
    }

    /// Pop every live entry whose deadline has passed. Popped entries
    /// leave the live set, so a concurrent cancel of them is a no-op.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledExpiry> {
        let mut queue = self.lock();
        let mut due = Vec::new();
        loop {
            queue.drop_stale_head();
            match queue.heap.peek() {
                Some(Reverse(head)) if head.expires_at <= now => {
                    if let Some(Reverse(entry)) = queue.heap.pop() {
                        queue.live.remove(&entry.key());
                        due.push(entry);
                    }
                }
                _ => break,
            }
        }
        due
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }
}

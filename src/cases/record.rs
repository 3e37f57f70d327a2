//! Moderation case records
//!
//! A case is one immutable ledger entry representing a moderation action
//! or its reversal. Reversal is modeled as a new case linked back to the
//! superseded one, never as an in-place edit; the only fields the store
//! may touch after append are `active` and `reversed_case_id`.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Sentinel actor id for cases issued by the engine itself
/// (auto-moderation, escalation, expiry reversals)
pub const SYSTEM_ACTOR_ID: u64 = 0;

/// Kind of moderation case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CaseKind {
    #[display("ban")]
    Ban,
    #[display("kick")]
    Kick,
    #[display("timeout")]
    Timeout,
    #[display("warn")]
    Warn,
    #[display("unwarn")]
    Unwarn,
    #[display("untimeout")]
    Untimeout,
    #[display("unban")]
    Unban,
}

impl CaseKind {
    /// Whether this kind records the reversal of an earlier case
    #[must_use]
    pub fn is_reversal(self) -> bool {
        matches!(self, Self::Unwarn | Self::Untimeout | Self::Unban)
    }

    /// Whether a case of this kind can ever be in effect. Kick is
    /// terminal (no reversal exists) and reversal kinds are records of
    /// an undo, so neither is ever active.
    #[must_use]
    pub fn tracks_active(self) -> bool {
        matches!(self, Self::Ban | Self::Timeout | Self::Warn)
    }
}

/// One immutable entry in a guild's moderation ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    /// Monotonically increasing per guild, assigned at append, never reused
    pub case_id: u64,
    pub guild_id: u64,
    pub target_user_id: u64,
    /// Issuing moderator, or [`SYSTEM_ACTOR_ID`]
    pub actor_id: u64,
    pub kind: CaseKind,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Present only for time-bounded punishments
    pub expires_at: Option<DateTime<Utc>>,
    /// Punishment cases start inactive and are flipped once the executor
    /// confirms the real-world effect; warn cases are active at append
    pub active: bool,
    /// Id of the case that reversed this one, once reversed
    pub reversed_case_id: Option<u64>,
}

impl Case {
    /// Whether this case represents a ban or timeout punishment
    #[must_use]
    pub fn is_punishment(&self) -> bool {
        matches!(self.kind, CaseKind::Ban | CaseKind::Timeout)
    }

    #[must_use]
    pub fn system_issued(&self) -> bool {
        self.actor_id == SYSTEM_ACTOR_ID
    }
}

/// Input to [`crate::cases::CaseStore::append`], before a sequence
/// number is assigned
#[derive(Debug, Clone)]
pub struct CaseDraft {
    pub guild_id: u64,
    pub target_user_id: u64,
    pub actor_id: u64,
    pub kind: CaseKind,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl CaseDraft {
    /// Draft for a ban, kick, or timeout. Appended inactive; the
    /// orchestrator confirms it via `mark_applied` once the executor
    /// call succeeds.
    #[must_use]
    pub fn punishment(
        guild_id: u64,
        target_user_id: u64,
        actor_id: u64,
        kind: CaseKind,
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            guild_id,
            target_user_id,
            actor_id,
            kind,
            reason,
            expires_at,
            active: false,
        }
    }

    /// Draft for a warning. Active immediately: there is no external
    /// effect to confirm.
    #[must_use]
    pub fn warn(guild_id: u64, target_user_id: u64, actor_id: u64, reason: Option<String>) -> Self {
        Self {
            guild_id,
            target_user_id,
            actor_id,
            kind: CaseKind::Warn,
            reason,
            expires_at: None,
            active: true,
        }
    }

    /// Draft recording the reversal of `source` with the given inverse
    /// kind
    #[must_use]
    pub fn reversal(source: &Case, kind: CaseKind, actor_id: u64, reason: Option<String>) -> Self {
        Self {
            guild_id: source.guild_id,
            target_user_id: source.target_user_id,
            actor_id,
            kind,
            reason,
            expires_at: None,
            active: false,
        }
    }
}

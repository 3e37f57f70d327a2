//! Per-guild moderation policy
//!
//! Policy is read-mostly input owned by an external loader; the engine
//! re-reads a snapshot per guild at decision time so every orchestrated
//! operation works against fixed inputs.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Follow-up action recommended once a warning threshold is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationAction {
    Timeout { duration_secs: u32 },
    Kick,
    Ban,
}

/// One row of the escalation table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Active warning count at which this step fires
    pub at_warnings: u32,
    pub action: EscalationAction,
}

/// Configuration snapshot for a single guild
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildPolicy {
    pub guild_id: u64,
    /// Master switch for the message-event pipeline
    pub automod_enabled: bool,
    pub spam_detection: bool,
    pub duplicate_detection: bool,
    /// Lookback window for the spam counter, seconds
    pub spam_window_secs: u32,
    /// Messages within the window that trigger an abuse signal
    pub spam_threshold: u32,
    /// Consecutive near-duplicate messages that trigger the same signal
    pub duplicate_threshold: u32,
    /// Duration of the timeout synthesized from an abuse signal, seconds
    pub automod_timeout_secs: u32,
    /// Informational cap reported to the user on each warning
    pub max_warnings: u32,
    /// Ordered warning thresholds; the highest crossed step wins
    pub escalation: Vec<EscalationStep>,
}

impl Default for GuildPolicy {
    fn default() -> Self {
        Self {
            guild_id: 0,
            automod_enabled: false,
            spam_detection: true,
            duplicate_detection: true,
            spam_window_secs: 10,
            spam_threshold: 5,
            duplicate_threshold: 3,
            automod_timeout_secs: 600,
            max_warnings: 3,
            escalation: vec![
                EscalationStep {
                    at_warnings: 3,
                    action: EscalationAction::Timeout { duration_secs: 600 },
                },
                EscalationStep {
                    at_warnings: 5,
                    action: EscalationAction::Kick,
                },
                EscalationStep {
                    at_warnings: 7,
                    action: EscalationAction::Ban,
                },
            ],
        }
    }
}

impl GuildPolicy {
    #[must_use]
    pub fn default_for(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Self::default()
        }
    }
}

/// Map of guild id to policy with a configurable fallback
pub struct PolicyStore {
    policies: DashMap<u64, GuildPolicy>,
    fallback: GuildPolicy,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: DashMap::new(),
            fallback: GuildPolicy::default(),
        }
    }

    /// Use `fallback` for guilds with no explicit policy
    #[must_use]
    pub fn with_fallback(fallback: GuildPolicy) -> Self {
        Self {
            policies: DashMap::new(),
            fallback,
        }
    }

    pub fn set(&self, policy: GuildPolicy) {
        self.policies.insert(policy.guild_id, policy);
    }

    /// Snapshot for a guild; decisions made from it are reproducible
    /// even if the stored policy changes mid-operation
    #[must_use]
    pub fn for_guild(&self, guild_id: u64) -> GuildPolicy {
        self.policies
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| GuildPolicy {
                guild_id,
                ..self.fallback.clone()
            })
    }

    /// Load per-guild policies from a YAML file. A missing file yields
    /// an empty store.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let store = Self::new();
        if let Ok(contents) = tokio::fs::read_to_string(path.as_ref()).await {
            if let Ok(policies) = serde_yaml::from_str::<Vec<GuildPolicy>>(&contents) {
                for policy in policies {
                    store.policies.insert(policy.guild_id, policy);
                }
                info!(
                    target: crate::CONSOLE_TARGET,
                    path = %path.as_ref().display(),
                    guilds = store.policies.len(),
                    "Loaded guild policies"
                );
            }
        }
        store
    }

    /// Save all per-guild policies to a YAML file
    pub async fn save(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let policies: Vec<GuildPolicy> = self
            .policies
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let yaml = serde_yaml::to_string(&policies)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path.as_ref(), yaml).await?;
        Ok(())
    }
}

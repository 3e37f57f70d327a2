//! Case store
//!
//! The ledger is the engine's only required durable state: warning
//! counts and the active-punishment set are both derivable from it
//! alone. `YamlCaseStore` persists the full ledger as a YAML snapshot
//! rewritten on every mutation; a failed write rolls the in-memory
//! state back so callers never observe a half-applied operation.

use crate::cases::record::{Case, CaseDraft, CaseKind};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

/// Durable, ordered ledger of moderation cases
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Assign the next sequence number for the guild, persist, and
    /// return the stored case. Durable before returning.
    async fn append(&self, draft: CaseDraft) -> Result<Case, StoreError>;

    async fn get(&self, guild_id: u64, case_id: u64) -> Result<Case, StoreError>;

    /// A user's full record, reversed cases included, oldest first
    async fn list_for_user(&self, guild_id: u64, user_id: u64) -> Result<Vec<Case>, StoreError>;

    /// The most recent cases in a guild, newest first, at most `limit`
    async fn list_recent(&self, guild_id: u64, limit: usize) -> Result<Vec<Case>, StoreError>;

    /// All currently-active cases for a user, oldest first, optionally
    /// filtered by kind
    async fn list_active(
        &self,
        guild_id: u64,
        user_id: u64,
        kind: Option<CaseKind>,
    ) -> Result<Vec<Case>, StoreError>;

    /// Every active case with a deadline, across all guilds. Used once
    /// at startup to rebuild the expiry schedule.
    async fn list_all_punishments_with_expiry(&self) -> Result<Vec<Case>, StoreError>;

    async fn count_active_warnings(&self, guild_id: u64, user_id: u64)
    -> Result<u32, StoreError>;

    /// Flip a case active once the executor confirms its real-world
    /// effect. Returns the updated record.
    async fn mark_applied(&self, guild_id: u64, case_id: u64) -> Result<Case, StoreError>;

    /// Append `draft` as the reversal of `source_case_id` and mark the
    /// source inactive with a back-reference, in one atomic durable
    /// write. Both happen or neither does.
    async fn reverse(
        &self,
        guild_id: u64,
        source_case_id: u64,
        draft: CaseDraft,
    ) -> Result<Case, StoreError>;
}

#[derive(Default)]
struct Ledger {
    // Keyed by (guild_id, case_id); BTreeMap ordering doubles as the
    // oldest-first ordering of list queries.
    cases: BTreeMap<(u64, u64), Case>,
    next_ids: HashMap<u64, u64>,
}

impl Ledger {
    fn next_id(&mut self, guild_id: u64) -> u64 {
        let slot = self.next_ids.entry(guild_id).or_insert(1);
        let id = *slot;
        *slot += 1;
        id
    }

    fn unassign_id(&mut self, guild_id: u64) {
        if let Some(slot) = self.next_ids.get_mut(&guild_id) {
            *slot -= 1;
        }
    }

    fn snapshot(&self) -> Vec<Case> {
        self.cases.values().cloned().collect()
    }

    fn guild_range(
        &self,
        guild_id: u64,
    ) -> impl DoubleEndedIterator<Item = &Case> {
        self.cases
            .range((guild_id, u64::MIN)..=(guild_id, u64::MAX))
            .map(|(_, case)| case)
    }
}

/// YAML-file-backed [`CaseStore`]. Constructed without a path it is a
/// purely in-memory ledger for tests.
pub struct YamlCaseStore {
    ledger: Mutex<Ledger>,
    path: Option<PathBuf>,
}

impl YamlCaseStore {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            path: None,
        }
    }

    /// Fresh ledger that will persist to `path`
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            path: Some(path.into()),
        }
    }

    /// Rebuild the ledger from an existing snapshot file. A missing
    /// file yields an empty ledger; a corrupt one is an error rather
    /// than silent data loss.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut ledger = Ledger::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let cases: Vec<Case> = serde_yaml::from_str(&contents)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt ledger file: {e}")))?;
                for case in cases {
                    let next = ledger.next_ids.entry(case.guild_id).or_insert(1);
                    if case.case_id >= *next {
                        *next = case.case_id + 1;
                    }
                    ledger.cases.insert((case.guild_id, case.case_id), case);
                }
                info!(
                    target: crate::CASE_TARGET,
                    path = %path.display(),
                    cases = ledger.cases.len(),
                    "Loaded case ledger"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        }

        Ok(Self {
            ledger: Mutex::new(ledger),
            path: Some(path),
        })
    }

    async fn persist(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let yaml = serde_yaml::to_string(&ledger.snapshot())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }

        tokio::fs::write(path, yaml)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl CaseStore for YamlCaseStore {
    async fn append(&self, draft: CaseDraft) -> Result<Case, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let case_id = ledger.next_id(draft.guild_id);
        let case = Case {
            case_id,
            guild_id: draft.guild_id,
            target_user_id: draft.target_user_id,
            actor_id: draft.actor_id,
            kind: draft.kind,
            reason: draft.reason,
            created_at: Utc::now(),
            expires_at: draft.expires_at,
            active: draft.active,
            reversed_case_id: None,
        };
        ledger.cases.insert((case.guild_id, case_id), case.clone());

        if let Err(e) = self.persist(&ledger).await {
            ledger.cases.remove(&(case.guild_id, case_id));
            ledger.unassign_id(case.guild_id);
            return Err(e);
        }

        info!(
            target: crate::CASE_TARGET,
            guild_id = case.guild_id,
            case_id = case.case_id,
            kind = %case.kind,
            target_user_id = case.target_user_id,
            "Case appended"
        );
        Ok(case)
    }

    async fn get(&self, guild_id: u64, case_id: u64) -> Result<Case, StoreError> {
        let ledger = self.ledger.lock().await;
        ledger
            .cases
            .get(&(guild_id, case_id))
            .cloned()
            .ok_or(StoreError::NotFound { guild_id, case_id })
    }

    async fn list_for_user(&self, guild_id: u64, user_id: u64) -> Result<Vec<Case>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .guild_range(guild_id)
            .filter(|case| case.target_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_recent(&self, guild_id: u64, limit: usize) -> Result<Vec<Case>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .guild_range(guild_id)
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_active(
        &self,
        guild_id: u64,
        user_id: u64,
        kind: Option<CaseKind>,
    ) -> Result<Vec<Case>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .guild_range(guild_id)
            .filter(|case| {
                case.active
                    && case.target_user_id == user_id
                    && kind.is_none_or(|k| case.kind == k)
            })
            .cloned()
            .collect())
    }

    async fn list_all_punishments_with_expiry(&self) -> Result<Vec<Case>, StoreError> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .cases
            .values()
            .filter(|case| case.active && case.expires_at.is_some())
            .cloned()
            .collect())
    }

    async fn count_active_warnings(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<u32, StoreError> {
        let ledger = self.ledger.lock().await;
        let count = ledger
            .guild_range(guild_id)
            .filter(|case| {
                case.active && case.kind == CaseKind::Warn && case.target_user_id == user_id
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn mark_applied(&self, guild_id: u64, case_id: u64) -> Result<Case, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let case = ledger
            .cases
            .get_mut(&(guild_id, case_id))
            .ok_or(StoreError::NotFound { guild_id, case_id })?;
        let before = case.clone();
        case.active = true;
        let updated = case.clone();

        if let Err(e) = self.persist(&ledger).await {
            ledger.cases.insert((guild_id, case_id), before);
            return Err(e);
        }
        Ok(updated)
    }

    async fn reverse(
        &self,
        guild_id: u64,
        source_case_id: u64,
        draft: CaseDraft,
    ) -> Result<Case, StoreError> {
        let mut ledger = self.ledger.lock().await;
        let source_before = ledger
            .cases
            .get(&(guild_id, source_case_id))
            .cloned()
            .ok_or(StoreError::NotFound {
                guild_id,
                case_id: source_case_id,
            })?;

        let case_id = ledger.next_id(guild_id);
        let reversal = Case {
            case_id,
            guild_id: draft.guild_id,
            target_user_id: draft.target_user_id,
            actor_id: draft.actor_id,
            kind: draft.kind,
            reason: draft.reason,
            created_at: Utc::now(),
            expires_at: None,
            active: false,
            reversed_case_id: None,
        };
        ledger.cases.insert((guild_id, case_id), reversal.clone());
        if let Some(source) = ledger.cases.get_mut(&(guild_id, source_case_id)) {
            source.active = false;
            source.reversed_case_id = Some(case_id);
        }

        if let Err(e) = self.persist(&ledger).await {
            ledger.cases.remove(&(guild_id, case_id));
            ledger.unassign_id(guild_id);
            ledger
                .cases
                .insert((guild_id, source_case_id), source_before);
            return Err(e);
        }

        info!(
            target: crate::CASE_TARGET,
            guild_id,
            case_id,
            source_case_id,
            kind = %reversal.kind,
            "Case reversed"
        );
        Ok(reversal)
    }
}

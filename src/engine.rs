//! Moderation orchestrator
//!
//! [`ModerationEngine`] is the single entry point for moderation
//! requests and message events. Every operation on one (guild, user)
//! pair runs under a per-pair async mutex, so the read-decide-write
//! sequences below never interleave for the same member. The expiry
//! side runs as one spawned task woken over an mpsc channel whenever a
//! deadline moves earlier.

use crate::automod::{MessageEvent, SpamDetector};
use crate::cases::{Case, CaseDraft, CaseKind, CaseStore, SYSTEM_ACTOR_ID};
use crate::config::{EscalationAction, PolicyStore};
use crate::error::{EngineError, EngineResult};
use crate::escalation;
use crate::executor::{with_retry, ActionExecutor, EventSink};
use crate::scheduler::{ExpiryCommand, ExpirySchedule, PunishmentKind, ScheduledExpiry};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use derive_more::Display;
use std::sync::{Arc, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Channel depth for expiry task wakeups; Recheck is idempotent so a
/// full channel is never a correctness problem
const COMMAND_BUFFER: usize = 64;

/// Fallback wait when nothing is scheduled
const IDLE_WAIT_SECS: u64 = 3600;

/// Delay before re-attempting an expiry whose ledger write failed
const EXPIRY_RETRY_SECS: i64 = 30;

/// Operation requested by a moderator or synthesized by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RequestKind {
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
    #[display("clear_warnings")]
    ClearWarnings,
    #[display("untimeout")]
    Untimeout,
    #[display("unban")]
    Unban,
}

/// One moderation request against a single member
#[derive(Debug, Clone)]
pub struct ModerationRequest {
    pub kind: RequestKind,
    pub guild_id: u64,
    pub target_user_id: u64,
    /// Issuing moderator, or [`SYSTEM_ACTOR_ID`] for engine-issued
    /// requests
    pub actor_id: u64,
    pub reason: Option<String>,
    /// Required for timeouts; optional for bans (absent means permanent)
    pub duration_secs: Option<u32>,
}

/// The moderation engine. Cheap to clone; all state is shared behind
/// `Arc`.
#[derive(Clone)]
pub struct ModerationEngine {
    store: Arc<dyn CaseStore>,
    executor: Arc<dyn ActionExecutor>,
    sink: Arc<dyn EventSink>,
    policies: Arc<PolicyStore>,
    detector: Arc<SpamDetector>,
    schedule: Arc<ExpirySchedule>,
    user_locks: Arc<DashMap<(u64, u64), Arc<Mutex<()>>>>,
    // Channel is created at construction so every clone shares the
    // sender; the receiver waits here until `start` claims it
    command_tx: mpsc::Sender<ExpiryCommand>,
    command_rx: Arc<std::sync::Mutex<Option<mpsc::Receiver<ExpiryCommand>>>>,
}

impl ModerationEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn CaseStore>,
        executor: Arc<dyn ActionExecutor>,
        sink: Arc<dyn EventSink>,
        policies: Arc<PolicyStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            store,
            executor,
            sink,
            policies,
            detector: Arc::new(SpamDetector::new()),
            schedule: Arc::new(ExpirySchedule::new()),
            user_locks: Arc::new(DashMap::new()),
            command_tx,
            command_rx: Arc::new(std::sync::Mutex::new(Some(command_rx))),
        }
    }

    /// Replace the default detector with one carrying content filters
    #[must_use]
    pub fn with_content_filters(
        mut self,
        filters: Vec<Box<dyn crate::automod::ContentFilter>>,
    ) -> Self {
        self.detector = Arc::new(SpamDetector::with_filters(filters));
        self
    }

    /// Spawn the expiry task. Requests work without it but timed
    /// punishments will not lift on time. Idempotent: later calls find
    /// the receiver already claimed and do nothing. Any clone of the
    /// engine may call it and any clone can wake the spawned task.
    pub fn start(&self) {
        let Some(rx) = self
            .command_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let engine = self.clone();
        tokio::spawn(async move {
            engine.expiry_task(rx).await;
        });
    }

    /// Ask the expiry task to exit after its current iteration
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(ExpiryCommand::Shutdown).await;
    }

    /// Wake the expiry task to re-read the earliest deadline. Lossy by
    /// design: if the channel is full a wakeup is already pending.
    fn poke(&self) {
        let _ = self.command_tx.try_send(ExpiryCommand::Recheck);
    }

    fn user_lock(&self, guild_id: u64, user_id: u64) -> Arc<Mutex<()>> {
        self.user_locks
            .entry((guild_id, user_id))
            .or_default()
            .clone()
    }

    fn validate(request: &ModerationRequest) -> EngineResult<()> {
        if request.target_user_id == SYSTEM_ACTOR_ID {
            return Err(EngineError::InvalidRequest(
                "target user id is the reserved system actor".to_string(),
            ));
        }
        if request.duration_secs == Some(0) {
            return Err(EngineError::InvalidRequest(
                "duration must be positive".to_string(),
            ));
        }
        if request.kind == RequestKind::Timeout && request.duration_secs.is_none() {
            return Err(EngineError::InvalidRequest(
                "timeout requires a duration".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply one moderation request. Returns every case the request
    /// produced, in creation order: reversals of superseded punishments
    /// first, then the new case, then any escalation follow-up.
    pub async fn handle_request(&self, request: ModerationRequest) -> EngineResult<Vec<Case>> {
        Self::validate(&request)?;
        info!(
            target: crate::CASE_TARGET,
            guild_id = request.guild_id,
            target_user_id = request.target_user_id,
            actor_id = request.actor_id,
            kind = %request.kind,
            "Handling moderation request"
        );

        let lock = self.user_lock(request.guild_id, request.target_user_id);
        let _guard = lock.lock().await;
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: ModerationRequest) -> EngineResult<Vec<Case>> {
        let expires_at = request
            .duration_secs
            .map(|secs| Utc::now() + Duration::seconds(i64::from(secs)));
        match request.kind {
            RequestKind::Ban => self.punish(PunishmentKind::Ban, &request, expires_at).await,
            RequestKind::Timeout => {
                self.punish(PunishmentKind::Timeout, &request, expires_at)
                    .await
            }
            RequestKind::Kick => self.kick(&request).await,
            RequestKind::Warn => self.warn(&request).await,
            RequestKind::Unwarn => self.unwarn(&request).await,
            RequestKind::ClearWarnings => self.clear_warnings(&request).await,
            RequestKind::Untimeout => self.lift(PunishmentKind::Timeout, &request).await,
            RequestKind::Unban => self.lift(PunishmentKind::Ban, &request).await,
        }
    }

    /// Ban or timeout: supersede any active punishment of the same
    /// kind, record the new case, apply it, then confirm it in the
    /// ledger and schedule its expiry.
    async fn punish(
        &self,
        kind: PunishmentKind,
        request: &ModerationRequest,
        expires_at: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<Case>> {
        let mut produced = Vec::new();

        // At most one punishment of a kind is active per member; a new
        // one replaces the old rather than stacking.
        if let Some(old) = self
            .store
            .list_active(
                request.guild_id,
                request.target_user_id,
                Some(kind.case_kind()),
            )
            .await?
            .pop()
        {
            self.schedule
                .cancel(old.guild_id, old.target_user_id, kind);
            if let Err(e) = self.remove_effect(kind, old.guild_id, old.target_user_id).await {
                // The new punishment is about to reimpose the effect
                // anyway; the ledger handover must not be blocked.
                warn!(
                    target: crate::ERROR_TARGET,
                    guild_id = old.guild_id,
                    case_id = old.case_id,
                    error = %e,
                    "Failed to lift superseded punishment, proceeding"
                );
            }
            let draft = CaseDraft::reversal(
                &old,
                kind.reversal_kind(),
                request.actor_id,
                Some(format!("superseded by new {kind}")),
            );
            let reversal = self.store.reverse(old.guild_id, old.case_id, draft).await?;
            self.sink.case_reversed(&old, &reversal);
            produced.push(reversal);
        }

        let recorded = self
            .store
            .append(CaseDraft::punishment(
                request.guild_id,
                request.target_user_id,
                request.actor_id,
                kind.case_kind(),
                request.reason.clone(),
                expires_at,
            ))
            .await?;

        let applied = match kind {
            PunishmentKind::Ban => {
                with_retry(|| {
                    self.executor.apply_ban(
                        request.guild_id,
                        request.target_user_id,
                        request.reason.clone(),
                    )
                })
                .await
            }
            PunishmentKind::Timeout => {
                let until = expires_at.ok_or_else(|| {
                    EngineError::InvalidRequest("timeout requires a duration".to_string())
                })?;
                with_retry(|| {
                    self.executor.apply_timeout(
                        request.guild_id,
                        request.target_user_id,
                        until,
                        request.reason.clone(),
                    )
                })
                .await
            }
        };

        if let Err(e) = applied {
            // The attempt stays in the ledger, inactive, as an audit
            // record of a punishment that never took effect.
            self.sink.case_created(&recorded);
            return Err(e.into());
        }

        let case = self
            .store
            .mark_applied(recorded.guild_id, recorded.case_id)
            .await?;
        if let Some(at) = case.expires_at {
            let preempts = self.schedule.insert(ScheduledExpiry {
                expires_at: at,
                guild_id: case.guild_id,
                user_id: case.target_user_id,
                kind,
                case_id: case.case_id,
            });
            if preempts {
                self.poke();
            }
        }
        self.sink.case_created(&case);
        produced.push(case);
        Ok(produced)
    }

    /// Kick: terminal, nothing to schedule or supersede
    async fn kick(&self, request: &ModerationRequest) -> EngineResult<Vec<Case>> {
        let recorded = self
            .store
            .append(CaseDraft::punishment(
                request.guild_id,
                request.target_user_id,
                request.actor_id,
                CaseKind::Kick,
                request.reason.clone(),
                None,
            ))
            .await?;

        let applied = with_retry(|| {
            self.executor.apply_kick(
                request.guild_id,
                request.target_user_id,
                request.reason.clone(),
            )
        })
        .await;

        self.sink.case_created(&recorded);
        applied?;
        Ok(vec![recorded])
    }

    async fn warn(&self, request: &ModerationRequest) -> EngineResult<Vec<Case>> {
        let policy = self.policies.for_guild(request.guild_id);
        let case = self
            .store
            .append(CaseDraft::warn(
                request.guild_id,
                request.target_user_id,
                request.actor_id,
                request.reason.clone(),
            ))
            .await?;
        self.sink.case_created(&case);

        let count = self
            .store
            .count_active_warnings(request.guild_id, request.target_user_id)
            .await?;

        let notice = if count >= policy.max_warnings {
            format!(
                "You have received warning {count} of {max}: the warning limit is reached",
                max = policy.max_warnings
            )
        } else {
            format!(
                "You have received warning {count} of {max}",
                max = policy.max_warnings
            )
        };
        if let Err(e) = self
            .executor
            .send_notification(request.guild_id, request.target_user_id, notice)
            .await
        {
            // Notification is best effort; the warning already counts
            warn!(
                target: crate::ERROR_TARGET,
                guild_id = request.guild_id,
                target_user_id = request.target_user_id,
                error = %e,
                "Failed to notify user of warning"
            );
        }

        let mut produced = vec![case.clone()];
        if let Some(action) =
            escalation::next_action(&policy.escalation, count.saturating_sub(1), count)
        {
            info!(
                target: crate::CASE_TARGET,
                guild_id = request.guild_id,
                target_user_id = request.target_user_id,
                warnings = count,
                "Warning threshold crossed, escalating"
            );
            let follow_up = ModerationRequest {
                kind: RequestKind::Warn, // replaced below per action
                guild_id: request.guild_id,
                target_user_id: request.target_user_id,
                actor_id: SYSTEM_ACTOR_ID,
                reason: Some(format!(
                    "escalation after warning #{} ({count} active warnings)",
                    case.case_id
                )),
                duration_secs: None,
            };
            let escalated = match action {
                EscalationAction::Timeout { duration_secs } => {
                    let until = Utc::now() + Duration::seconds(i64::from(duration_secs));
                    self.punish(
                        PunishmentKind::Timeout,
                        &ModerationRequest {
                            kind: RequestKind::Timeout,
                            duration_secs: Some(duration_secs),
                            ..follow_up
                        },
                        Some(until),
                    )
                    .await
                }
                EscalationAction::Kick => {
                    self.kick(&ModerationRequest {
                        kind: RequestKind::Kick,
                        ..follow_up
                    })
                    .await
                }
                EscalationAction::Ban => {
                    self.punish(
                        PunishmentKind::Ban,
                        &ModerationRequest {
                            kind: RequestKind::Ban,
                            ..follow_up
                        },
                        None,
                    )
                    .await
                }
            };
            match escalated {
                Ok(cases) => produced.extend(cases),
                // The warning itself stands either way
                Err(e) => warn!(
                    target: crate::ERROR_TARGET,
                    guild_id = request.guild_id,
                    target_user_id = request.target_user_id,
                    error = %e,
                    "Escalation follow-up failed"
                ),
            }
        }
        Ok(produced)
    }

    /// Reverse the most recent active warning; a member with none is a
    /// no-op, not an error
    async fn unwarn(&self, request: &ModerationRequest) -> EngineResult<Vec<Case>> {
        let Some(latest) = self
            .store
            .list_active(
                request.guild_id,
                request.target_user_id,
                Some(CaseKind::Warn),
            )
            .await?
            .pop()
        else {
            return Ok(Vec::new());
        };

        let draft = CaseDraft::reversal(
            &latest,
            CaseKind::Unwarn,
            request.actor_id,
            request.reason.clone(),
        );
        let reversal = self
            .store
            .reverse(latest.guild_id, latest.case_id, draft)
            .await?;
        self.sink.case_reversed(&latest, &reversal);
        Ok(vec![reversal])
    }

    async fn clear_warnings(&self, request: &ModerationRequest) -> EngineResult<Vec<Case>> {
        let warnings = self
            .store
            .list_active(
                request.guild_id,
                request.target_user_id,
                Some(CaseKind::Warn),
            )
            .await?;

        let mut produced = Vec::with_capacity(warnings.len());
        for warning in warnings {
            let draft = CaseDraft::reversal(
                &warning,
                CaseKind::Unwarn,
                request.actor_id,
                request.reason.clone(),
            );
            let reversal = self
                .store
                .reverse(warning.guild_id, warning.case_id, draft)
                .await?;
            self.sink.case_reversed(&warning, &reversal);
            produced.push(reversal);
        }
        Ok(produced)
    }

    /// Manually lift an active ban or timeout. The real-world effect is
    /// removed before the ledger is touched: if removal keeps failing
    /// transiently the punishment stays recorded as active and the
    /// caller can retry. A permanent failure (effect already gone on
    /// the platform) still resolves the ledger.
    async fn lift(
        &self,
        kind: PunishmentKind,
        request: &ModerationRequest,
    ) -> EngineResult<Vec<Case>> {
        let Some(active) = self
            .store
            .list_active(
                request.guild_id,
                request.target_user_id,
                Some(kind.case_kind()),
            )
            .await?
            .pop()
        else {
            return Ok(Vec::new());
        };

        match self
            .remove_effect(kind, active.guild_id, active.target_user_id)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_permanent() => {
                warn!(
                    target: crate::ERROR_TARGET,
                    guild_id = active.guild_id,
                    case_id = active.case_id,
                    error = %e,
                    "Removal failed permanently, resolving ledger anyway"
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.schedule
            .cancel(active.guild_id, active.target_user_id, kind);
        let draft = CaseDraft::reversal(
            &active,
            kind.reversal_kind(),
            request.actor_id,
            request.reason.clone(),
        );
        let reversal = self
            .store
            .reverse(active.guild_id, active.case_id, draft)
            .await?;
        self.sink.case_reversed(&active, &reversal);
        Ok(vec![reversal])
    }

    async fn remove_effect(
        &self,
        kind: PunishmentKind,
        guild_id: u64,
        user_id: u64,
    ) -> Result<(), crate::error::ExecutorError> {
        match kind {
            PunishmentKind::Ban => {
                with_retry(|| self.executor.remove_ban(guild_id, user_id)).await
            }
            PunishmentKind::Timeout => {
                with_retry(|| self.executor.remove_timeout(guild_id, user_id)).await
            }
        }
    }

    /// Resolve one due expiry: lift the effect and record the reversal.
    /// The ledger is resolved even when the executor fails, because a
    /// platform timeout lapses on its own and leaving the case active
    /// would wedge supersession forever.
    async fn fire_expiry(&self, entry: ScheduledExpiry) {
        let lock = self.user_lock(entry.guild_id, entry.user_id);
        let _guard = lock.lock().await;

        let case = match self.store.get(entry.guild_id, entry.case_id).await {
            Ok(case) => case,
            Err(crate::error::StoreError::NotFound { .. }) => return,
            Err(e) => {
                warn!(
                    target: crate::SCHEDULER_TARGET,
                    guild_id = entry.guild_id,
                    case_id = entry.case_id,
                    error = %e,
                    "Ledger unavailable at expiry, rescheduling"
                );
                self.reschedule(entry);
                return;
            }
        };
        // Lifted or superseded while this entry was in flight
        if !case.active {
            return;
        }

        info!(
            target: crate::SCHEDULER_TARGET,
            guild_id = case.guild_id,
            case_id = case.case_id,
            kind = %case.kind,
            target_user_id = case.target_user_id,
            "Punishment expired"
        );

        let removal = self
            .remove_effect(entry.kind, case.guild_id, case.target_user_id)
            .await;

        let draft = CaseDraft::reversal(
            &case,
            entry.kind.reversal_kind(),
            SYSTEM_ACTOR_ID,
            Some("punishment expired".to_string()),
        );
        match self.store.reverse(case.guild_id, case.case_id, draft).await {
            Ok(reversal) => match removal {
                Ok(()) => self.sink.case_reversed(&case, &reversal),
                Err(e) => self.sink.scheduler_failure(&case, &e),
            },
            Err(e) => {
                warn!(
                    target: crate::SCHEDULER_TARGET,
                    guild_id = case.guild_id,
                    case_id = case.case_id,
                    error = %e,
                    "Failed to record expiry reversal, rescheduling"
                );
                self.reschedule(entry);
            }
        }
    }

    fn reschedule(&self, mut entry: ScheduledExpiry) {
        entry.expires_at = Utc::now() + Duration::seconds(EXPIRY_RETRY_SECS);
        if self.schedule.insert(entry) {
            self.poke();
        }
    }

    async fn run_due(&self, now: DateTime<Utc>) {
        for entry in self.schedule.pop_due(now) {
            self.fire_expiry(entry).await;
        }
    }

    /// Single timer task: sleep until the earliest deadline, fire
    /// everything due, re-arm. Recheck shortens the wait when an insert
    /// preempts the current deadline.
    async fn expiry_task(self, mut rx: mpsc::Receiver<ExpiryCommand>) {
        info!(target: crate::SCHEDULER_TARGET, "Expiry task started");
        loop {
            let now = Utc::now();
            match self.schedule.next_deadline() {
                Some(deadline) if deadline <= now => {
                    self.run_due(now).await;
                }
                Some(deadline) => {
                    let wait = (deadline - now)
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    tokio::select! {
                        command = rx.recv() => match command {
                            Some(ExpiryCommand::Recheck) => {}
                            Some(ExpiryCommand::Shutdown) | None => break,
                        },
                        () = tokio::time::sleep(wait) => {
                            self.run_due(Utc::now()).await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        command = rx.recv() => match command {
                            Some(ExpiryCommand::Recheck) => {}
                            Some(ExpiryCommand::Shutdown) | None => break,
                        },
                        () = tokio::time::sleep(std::time::Duration::from_secs(IDLE_WAIT_SECS)) => {}
                    }
                }
            }
        }
        info!(target: crate::SCHEDULER_TARGET, "Expiry task stopped");
    }

    /// Rebuild the expiry schedule from the ledger after a restart.
    /// Already-overdue punishments are resolved inline. Returns the
    /// number of punishments recovered.
    pub async fn recover(&self) -> EngineResult<usize> {
        let pending = self.store.list_all_punishments_with_expiry().await?;
        let mut recovered = 0;
        let now = Utc::now();

        for case in pending {
            let Some(kind) = PunishmentKind::from_case(case.kind) else {
                continue;
            };
            let Some(expires_at) = case.expires_at else {
                continue;
            };
            let entry = ScheduledExpiry {
                expires_at,
                guild_id: case.guild_id,
                user_id: case.target_user_id,
                kind,
                case_id: case.case_id,
            };
            if expires_at <= now {
                self.fire_expiry(entry).await;
            } else {
                self.schedule.insert(entry);
            }
            recovered += 1;
        }

        info!(
            target: crate::SCHEDULER_TARGET,
            recovered, "Rebuilt expiry schedule from ledger"
        );
        self.poke();
        Ok(recovered)
    }

    /// Feed one message event through auto-moderation. Returns the
    /// cases produced by any synthesized punishment, or an empty list
    /// when the message passes.
    pub async fn handle_message(&self, event: &MessageEvent) -> EngineResult<Vec<Case>> {
        let policy = self.policies.for_guild(event.guild_id);
        if !policy.automod_enabled {
            return Ok(Vec::new());
        }
        let Some(signal) = self.detector.observe(event, &policy) else {
            return Ok(Vec::new());
        };

        self.handle_request(ModerationRequest {
            kind: RequestKind::Timeout,
            guild_id: signal.guild_id,
            target_user_id: signal.user_id,
            actor_id: SYSTEM_ACTOR_ID,
            reason: Some(signal.kind.to_string()),
            duration_secs: Some(policy.automod_timeout_secs),
        })
        .await
    }
}

pub mod automod;
pub mod cases;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod logging;
pub mod scheduler;

pub const ENGINE_NAME: &str = "warden";
pub const CASE_TARGET: &str = "warden::cases";
pub const AUTOMOD_TARGET: &str = "warden::automod";
pub const SCHEDULER_TARGET: &str = "warden::scheduler";
pub const ERROR_TARGET: &str = "warden::error";
pub const CONSOLE_TARGET: &str = "warden";

pub use automod::{AbuseKind, AbuseSignal, ContentFilter, MessageEvent, SpamDetector};
pub use cases::{Case, CaseDraft, CaseKind, CaseStore, SYSTEM_ACTOR_ID, YamlCaseStore};
pub use config::{EscalationAction, EscalationStep, GuildPolicy, PolicyStore};
pub use engine::{ModerationEngine, ModerationRequest, RequestKind};
pub use error::{EngineError, EngineResult, ExecutorError, StoreError};
pub use executor::{ActionExecutor, EventSink, TracingEventSink};
pub use scheduler::{ExpiryCommand, ExpirySchedule, PunishmentKind, ScheduledExpiry};

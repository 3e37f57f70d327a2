//! Case ledger for the moderation engine
//!
//! The ledger is an append-only event log, not a row-level CRUD table:
//! every action and every reversal is its own record, which is what lets
//! the expiry scheduler rebuild its state purely by replay.

mod record;
mod store;

pub use record::{Case, CaseDraft, CaseKind, SYSTEM_ACTOR_ID};
pub use store::{CaseStore, YamlCaseStore};

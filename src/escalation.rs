//! Warning escalation policy
//!
//! Pure decision function over the configured threshold table. The
//! orchestrator executes the recommendation; keeping the two apart makes
//! the policy testable with fixed inputs.

use crate::config::{EscalationAction, EscalationStep};

/// Recommend a follow-up action for a warning count that moved from
/// `previous_count` to `new_count`.
///
/// Only thresholds crossed by this transition fire, so a count that
/// already sat past a threshold never re-fires it. When a bulk change
/// crosses several thresholds at once, the highest one wins.
#[must_use]
pub fn next_action(
    steps: &[EscalationStep],
    previous_count: u32,
    new_count: u32,
) -> Option<EscalationAction> {
    steps
        .iter()
        .filter(|step| step.at_warnings > previous_count && step.at_warnings <= new_count)
        .max_by_key(|step| step.at_warnings)
        .map(|step| step.action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<EscalationStep> {
        vec![
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
        ]
    }

    #[test]
    fn test_threshold_fires_exactly_once() {
        let steps = table();
        assert_eq!(next_action(&steps, 0, 1), None);
        assert_eq!(next_action(&steps, 1, 2), None);
        assert_eq!(
            next_action(&steps, 2, 3),
            Some(EscalationAction::Timeout { duration_secs: 600 })
        );
        // Already past 3; no re-fire
        assert_eq!(next_action(&steps, 3, 4), None);
        assert_eq!(next_action(&steps, 4, 5), Some(EscalationAction::Kick));
        assert_eq!(next_action(&steps, 6, 7), Some(EscalationAction::Ban));
        assert_eq!(next_action(&steps, 7, 8), None);
    }

    #[test]
    fn test_bulk_jump_resolves_to_highest() {
        let steps = table();
        // Jumping from 2 to 6 crosses both 3 and 5; the stronger wins
        assert_eq!(next_action(&steps, 2, 6), Some(EscalationAction::Kick));
        assert_eq!(next_action(&steps, 0, 9), Some(EscalationAction::Ban));
    }

    #[test]
    fn test_unordered_table() {
        let mut steps = table();
        steps.reverse();
        assert_eq!(next_action(&steps, 2, 6), Some(EscalationAction::Kick));
    }

    #[test]
    fn test_empty_table_never_escalates() {
        assert_eq!(next_action(&[], 0, 100), None);
    }

    #[test]
    fn test_downward_change_never_fires() {
        // Clearing warnings crosses thresholds downward; no action
        let steps = table();
        assert_eq!(next_action(&steps, 7, 0), None);
    }
}

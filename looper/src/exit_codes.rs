//! Stable exit codes for looper CLI commands.

use crate::core::types::ExitReason;

/// Command succeeded or the session completed.
pub const OK: i32 = 0;
/// Invalid layout/config, or the session ended on a fatal error.
pub const INVALID: i32 = 1;
/// Session ran out of iterations or stagnated.
pub const EXHAUSTED: i32 = 2;
/// Session stopped by the stop key, the stop file, or an interrupt.
pub const STOPPED: i32 = 3;
/// Session completed but verification flagged it for manual review.
pub const NEEDS_REVIEW: i32 = 4;

pub fn for_reason(reason: &ExitReason) -> i32 {
    match reason {
        ExitReason::Completed => OK,
        ExitReason::NeedsReview { .. } => NEEDS_REVIEW,
        ExitReason::BudgetExhausted { .. } | ExitReason::Stagnation { .. } => EXHAUSTED,
        ExitReason::StopRequested { .. } | ExitReason::Interrupted => STOPPED,
        ExitReason::Fatal { .. } => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StopSource;

    #[test]
    fn reasons_map_to_stable_codes() {
        assert_eq!(for_reason(&ExitReason::Completed), 0);
        assert_eq!(for_reason(&ExitReason::Stagnation { consecutive: 2 }), 2);
        assert_eq!(
            for_reason(&ExitReason::StopRequested {
                source: StopSource::File
            }),
            3
        );
        assert_eq!(for_reason(&ExitReason::Interrupted), 3);
        assert_eq!(
            for_reason(&ExitReason::NeedsReview {
                detail: String::new()
            }),
            4
        );
    }
}

//! Iteration boundary decision.
//!
//! Precedence when several conditions trigger on the same boundary:
//! completion, then stagnation, then a pending stop request.

use crate::core::status::StatusSnapshot;
use crate::core::types::{ExecutionMode, StopSource, StopState};

/// Consecutive no-op iteration counter for autonomous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagnationTracker {
    threshold: u32,
    count: u32,
}

impl StagnationTracker {
    /// `threshold == 0` disables detection.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Update the counter from a snapshot. Only autonomous mode counts.
    pub fn observe(&mut self, mode: ExecutionMode, snapshot: &StatusSnapshot) {
        if mode != ExecutionMode::Autonomous || self.threshold == 0 {
            return;
        }
        if snapshot.worked() == Some(false) {
            self.count += 1;
        } else {
            self.count = 0;
        }
    }

    pub fn is_stagnant(&self) -> bool {
        self.threshold > 0 && self.count >= self.threshold
    }
}

/// What the scheduler should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryDecision {
    Continue,
    /// The agent claims completion.
    Complete,
    Stagnated { consecutive: u32 },
    Stop { source: StopSource },
}

/// Evaluate one iteration boundary. Updates `stagnation` as a side effect.
pub fn evaluate_boundary(
    mode: ExecutionMode,
    snapshot: &StatusSnapshot,
    stagnation: &mut StagnationTracker,
    stop: StopState,
) -> BoundaryDecision {
    stagnation.observe(mode, snapshot);

    if snapshot.complete {
        return BoundaryDecision::Complete;
    }
    if stagnation.is_stagnant() {
        return BoundaryDecision::Stagnated {
            consecutive: stagnation.count(),
        };
    }
    if stop.requested {
        return BoundaryDecision::Stop {
            source: stop.source,
        };
    }
    BoundaryDecision::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::RawStatus;

    fn autonomous(worked: Option<bool>, complete: bool) -> StatusSnapshot {
        StatusSnapshot::from_raw(
            RawStatus {
                complete,
                worked,
                ..RawStatus::default()
            },
            ExecutionMode::Autonomous,
        )
    }

    const NO_STOP: StopState = StopState {
        requested: false,
        source: StopSource::None,
    };

    #[test]
    fn stagnation_after_consecutive_noops() {
        let mut tracker = StagnationTracker::new(2);
        let mode = ExecutionMode::Autonomous;
        let noop = autonomous(Some(false), false);

        assert_eq!(
            evaluate_boundary(mode, &noop, &mut tracker, NO_STOP),
            BoundaryDecision::Continue
        );
        assert_eq!(
            evaluate_boundary(mode, &noop, &mut tracker, NO_STOP),
            BoundaryDecision::Stagnated { consecutive: 2 }
        );
    }

    #[test]
    fn work_resets_stagnation() {
        let mut tracker = StagnationTracker::new(2);
        let mode = ExecutionMode::Autonomous;
        evaluate_boundary(mode, &autonomous(Some(false), false), &mut tracker, NO_STOP);
        evaluate_boundary(mode, &autonomous(Some(true), false), &mut tracker, NO_STOP);
        assert_eq!(tracker.count(), 0);
        evaluate_boundary(mode, &autonomous(None, false), &mut tracker, NO_STOP);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn zero_threshold_disables_stagnation() {
        let mut tracker = StagnationTracker::new(0);
        for _ in 0..5 {
            let decision = evaluate_boundary(
                ExecutionMode::Autonomous,
                &autonomous(Some(false), false),
                &mut tracker,
                NO_STOP,
            );
            assert_eq!(decision, BoundaryDecision::Continue);
        }
    }

    #[test]
    fn incremental_mode_never_stagnates() {
        let mut tracker = StagnationTracker::new(1);
        let snapshot = StatusSnapshot::default_for(ExecutionMode::Incremental);
        let decision =
            evaluate_boundary(ExecutionMode::Incremental, &snapshot, &mut tracker, NO_STOP);
        assert_eq!(decision, BoundaryDecision::Continue);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn completion_wins_over_stagnation() {
        let mut tracker = StagnationTracker::new(1);
        let decision = evaluate_boundary(
            ExecutionMode::Autonomous,
            &autonomous(Some(false), true),
            &mut tracker,
            NO_STOP,
        );
        assert_eq!(decision, BoundaryDecision::Complete);
    }

    #[test]
    fn completion_wins_over_stop_request() {
        let mut tracker = StagnationTracker::new(0);
        let decision = evaluate_boundary(
            ExecutionMode::Autonomous,
            &autonomous(Some(true), true),
            &mut tracker,
            StopState::requested_by(StopSource::Keyboard),
        );
        assert_eq!(decision, BoundaryDecision::Complete);
    }

    #[test]
    fn stop_request_is_tagged_with_source() {
        let mut tracker = StagnationTracker::new(0);
        let decision = evaluate_boundary(
            ExecutionMode::Incremental,
            &StatusSnapshot::default_for(ExecutionMode::Incremental),
            &mut tracker,
            StopState::requested_by(StopSource::File),
        );
        assert_eq!(
            decision,
            BoundaryDecision::Stop {
                source: StopSource::File
            }
        );
    }
}

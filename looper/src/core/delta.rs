//! Change classification between two status snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::status::StatusSnapshot;

/// Field-level difference between the last emitted snapshot and the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusDelta {
    pub progress_changed: bool,
    pub completed_delta: i64,
    pub total_delta: i64,
    pub completion_status_changed: bool,
    pub summary_changed: bool,
    /// Anything else changed (worked flag, phase, blockers, notes).
    pub other_changed: bool,
}

impl StatusDelta {
    /// Compute the delta. With no previous snapshot every populated field counts as changed.
    pub fn between(previous: Option<&StatusSnapshot>, current: &StatusSnapshot) -> Self {
        let Some(previous) = previous else {
            let progress = current.progress().unwrap_or_default();
            return Self {
                progress_changed: current.progress().is_some(),
                completed_delta: progress.completed as i64,
                total_delta: progress.total as i64,
                completion_status_changed: current.complete,
                summary_changed: current.summary.is_some(),
                other_changed: true,
            };
        };

        let prev_progress = previous.progress().unwrap_or_default();
        let cur_progress = current.progress().unwrap_or_default();
        Self {
            progress_changed: previous.progress() != current.progress(),
            completed_delta: cur_progress.completed as i64 - prev_progress.completed as i64,
            total_delta: cur_progress.total as i64 - prev_progress.total as i64,
            completion_status_changed: previous.complete != current.complete,
            summary_changed: previous.summary != current.summary,
            other_changed: previous.worked() != current.worked()
                || previous.phase != current.phase
                || previous.blockers != current.blockers
                || previous.notes != current.notes,
        }
    }

    /// True if anything other than timestamp fields changed.
    pub fn is_meaningful(&self) -> bool {
        self.progress_changed
            || self.completion_status_changed
            || self.summary_changed
            || self.other_changed
    }
}

/// Debounced change notification emitted by the change watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub previous: Option<StatusSnapshot>,
    pub current: StatusSnapshot,
    pub delta: StatusDelta,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        previous: Option<StatusSnapshot>,
        current: StatusSnapshot,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let delta = StatusDelta::between(previous.as_ref(), &current);
        Self {
            previous,
            current,
            delta,
            timestamp,
        }
    }
}

/// Decide whether a freshly read snapshot should be emitted.
///
/// With `meaningful_only`, writes that only touched timestamps are suppressed.
/// Without it, any difference (timestamps included) is emitted.
pub fn should_emit(
    previous: Option<&StatusSnapshot>,
    current: &StatusSnapshot,
    meaningful_only: bool,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    if meaningful_only {
        !previous.same_content(current)
    } else {
        previous != current
    }
}

//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between components and are serialized
//! into the persisted session record, so their wire names must stay stable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution style of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Tracks explicit `completed/total` counts.
    #[default]
    Incremental,
    /// Tracks a boolean "did work happen" signal instead of counts.
    Autonomous,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Incremental => "incremental",
            ExecutionMode::Autonomous => "autonomous",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer requested a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopSource {
    #[default]
    None,
    Keyboard,
    File,
}

/// Snapshot of the shared cancellation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StopState {
    pub requested: bool,
    pub source: StopSource,
}

impl StopState {
    pub fn requested_by(source: StopSource) -> Self {
        Self {
            requested: true,
            source,
        }
    }
}

/// Lifecycle state of a session.
///
/// `Starting → Running → {Verifying} → {Completed | Stopped | Errored}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Verifying,
    Completed,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Stopped | SessionState::Errored
        )
    }
}

/// Why a session left the `Running` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitReason {
    /// The agent reported completion (and verification passed, if enabled).
    Completed,
    /// Completion was claimed but verification could not confirm it.
    NeedsReview { detail: String },
    /// `iteration_index` reached `max_iterations`.
    BudgetExhausted { iterations: u32 },
    /// Too many consecutive no-op iterations in autonomous mode.
    Stagnation { consecutive: u32 },
    /// A stop was requested via the keyboard toggle or the sentinel file.
    StopRequested { source: StopSource },
    /// The OS interrupt signal terminated the session.
    Interrupted,
    /// A fatal error (spawn failure or invariant violation).
    Fatal { message: String },
}

impl ExitReason {
    /// Terminal state implied by this reason.
    pub fn terminal_state(&self) -> SessionState {
        match self {
            ExitReason::Completed | ExitReason::NeedsReview { .. } => SessionState::Completed,
            ExitReason::BudgetExhausted { .. }
            | ExitReason::Stagnation { .. }
            | ExitReason::StopRequested { .. }
            | ExitReason::Interrupted => SessionState::Stopped,
            ExitReason::Fatal { .. } => SessionState::Errored,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Completed => write!(f, "completed"),
            ExitReason::NeedsReview { detail } => {
                write!(f, "completed, flagged for manual review: {detail}")
            }
            ExitReason::BudgetExhausted { iterations } => {
                write!(f, "iteration budget exhausted after {iterations} iterations")
            }
            ExitReason::Stagnation { consecutive } => {
                write!(f, "stagnation: {consecutive} consecutive iterations without work")
            }
            ExitReason::StopRequested { source } => match source {
                StopSource::Keyboard => write!(f, "stop requested via keyboard"),
                StopSource::File => write!(f, "stop requested via stop file"),
                StopSource::None => write!(f, "stop requested"),
            },
            ExitReason::Interrupted => write!(f, "interrupted"),
            ExitReason::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

/// Purpose of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationKind {
    Iteration,
    Resume,
    Verification,
}

impl InvocationKind {
    /// Whether the invocation spends one of the session's iterations.
    pub fn is_budgeted(self) -> bool {
        matches!(self, InvocationKind::Iteration | InvocationKind::Resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_is_not_budgeted() {
        assert!(InvocationKind::Iteration.is_budgeted());
        assert!(InvocationKind::Resume.is_budgeted());
        assert!(!InvocationKind::Verification.is_budgeted());
    }

    #[test]
    fn exit_reasons_map_to_terminal_states() {
        assert_eq!(ExitReason::Completed.terminal_state(), SessionState::Completed);
        assert_eq!(
            ExitReason::NeedsReview {
                detail: "fail".to_string()
            }
            .terminal_state(),
            SessionState::Completed
        );
        assert_eq!(
            ExitReason::BudgetExhausted { iterations: 3 }.terminal_state(),
            SessionState::Stopped
        );
        assert_eq!(
            ExitReason::Fatal {
                message: "spawn".to_string()
            }
            .terminal_state(),
            SessionState::Errored
        );
    }

    #[test]
    fn exit_reason_serializes_with_kind_tag() {
        let json = serde_json::to_string(&ExitReason::StopRequested {
            source: StopSource::File,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"kind":"stop_requested","source":"file"}"#);
    }
}

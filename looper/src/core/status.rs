//! Status snapshot model.
//!
//! The artifact on disk has one loose shape (`RawStatus`); in memory it is
//! narrowed to the fields that matter for the session's execution mode, so
//! mode-specific logic matches on [`ModeStatus`] instead of probing optionals.

use serde::{Deserialize, Serialize};

use crate::core::types::ExecutionMode;

/// Explicit `completed/total` counts reported in incremental mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
}

impl Progress {
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.completed)
    }
}

/// Status artifact exactly as the agent writes it (`.looper/status.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawStatus {
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Mode-specific part of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ModeStatus {
    Incremental { progress: Option<Progress> },
    Autonomous { worked: Option<bool> },
}

/// Parsed, mode-narrowed view of the status artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub complete: bool,
    pub detail: ModeStatus,
    pub summary: Option<String>,
    pub last_updated: Option<String>,
    pub phase: Option<String>,
    pub blockers: Vec<String>,
    pub notes: Option<String>,
}

impl StatusSnapshot {
    /// Snapshot substituted when the artifact is missing or malformed.
    pub fn default_for(mode: ExecutionMode) -> Self {
        let detail = match mode {
            ExecutionMode::Incremental => ModeStatus::Incremental {
                progress: Some(Progress::default()),
            },
            ExecutionMode::Autonomous => ModeStatus::Autonomous { worked: None },
        };
        Self {
            complete: false,
            detail,
            summary: None,
            last_updated: None,
            phase: None,
            blockers: Vec::new(),
            notes: None,
        }
    }

    /// Narrow a raw artifact to `mode`. Fields belonging to the other mode are dropped.
    pub fn from_raw(raw: RawStatus, mode: ExecutionMode) -> Self {
        let detail = match mode {
            ExecutionMode::Incremental => ModeStatus::Incremental {
                progress: raw.progress,
            },
            ExecutionMode::Autonomous => ModeStatus::Autonomous { worked: raw.worked },
        };
        Self {
            complete: raw.complete,
            detail,
            summary: raw.summary,
            last_updated: raw.last_updated,
            phase: raw.phase,
            blockers: raw.blockers.unwrap_or_default(),
            notes: raw.notes,
        }
    }

    pub fn progress(&self) -> Option<Progress> {
        match self.detail {
            ModeStatus::Incremental { progress } => progress,
            ModeStatus::Autonomous { .. } => None,
        }
    }

    pub fn worked(&self) -> Option<bool> {
        match self.detail {
            ModeStatus::Autonomous { worked } => worked,
            ModeStatus::Incremental { .. } => None,
        }
    }

    /// `total - completed`, or `None` when there is no progress concept.
    pub fn remaining(&self) -> Option<u64> {
        self.progress().map(|p| p.remaining())
    }

    /// Advisory consistency checks. Never fatal.
    pub fn consistency_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let ModeStatus::Incremental {
            progress: Some(progress),
        } = self.detail
        {
            if progress.completed > progress.total {
                warnings.push(format!(
                    "progress.completed ({}) exceeds progress.total ({})",
                    progress.completed, progress.total
                ));
            }
            if self.complete && progress.completed != progress.total {
                warnings.push(format!(
                    "complete=true but progress is {}/{}",
                    progress.completed, progress.total
                ));
            }
        }
        warnings
    }

    /// True when both snapshots are equal ignoring `last_updated`.
    pub fn same_content(&self, other: &StatusSnapshot) -> bool {
        self.complete == other.complete
            && self.detail == other.detail
            && self.summary == other.summary
            && self.phase == other.phase
            && self.blockers == other.blockers
            && self.notes == other.notes
    }
}

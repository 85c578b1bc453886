//! Persisted session record (`.looper/state/session.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{ExecutionMode, ExitReason, SessionState};

/// Snapshot of scheduler bookkeeping, rewritten at every iteration boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub mode: ExecutionMode,
    pub state: SessionState,
    pub exit_reason: Option<ExitReason>,
    /// Completed agent invocations counted against the budget.
    pub iteration_index: u32,
    pub max_iterations: u32,
    pub stagnation_count: u32,
    pub verification_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub average_iteration_secs: Option<f64>,
    pub eta_secs: Option<f64>,
    pub last_summary: Option<String>,
}

impl SessionRecord {
    pub fn new(session_id: String, mode: ExecutionMode, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            mode,
            state: SessionState::Starting,
            exit_reason: None,
            iteration_index: 0,
            max_iterations,
            stagnation_count: 0,
            verification_attempts: 0,
            started_at: now,
            updated_at: now,
            average_iteration_secs: None,
            eta_secs: None,
            last_summary: None,
        }
    }
}

/// `session-<UTC timestamp>-<pid>`.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    format!(
        "session-{}-{}",
        now.format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

/// Load the session record. `None` when no session has run yet.
pub fn load_session(path: &Path) -> Result<Option<SessionRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading session record");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    let record: SessionRecord = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    Ok(Some(record))
}

/// Atomically write the session record (temp file + rename).
pub fn write_session(path: &Path, record: &SessionRecord) -> Result<()> {
    debug!(
        path = %path.display(),
        state = ?record.state,
        iteration_index = record.iteration_index,
        "writing session record"
    );
    let mut buf = serde_json::to_string_pretty(record)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

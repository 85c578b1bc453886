//! Per-invocation logs under `.looper/iterations/<session-id>/<n>/`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::InvocationKind;
use crate::io::agent::CapturedOutput;
use crate::io::paths::LooperPaths;

#[derive(Debug, Clone, Serialize)]
pub struct IterationMeta {
    pub session_id: String,
    /// 1-based invocation number within the session.
    pub invocation: u32,
    pub kind: InvocationKind,
    /// Budgeted iteration index at the time of the invocation.
    pub iteration_index: u32,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// Set when the agent could not be run at all.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(paths: &LooperPaths, session_id: &str, invocation: u32) -> Self {
        let dir = paths.iteration_dir(session_id, invocation);
        Self {
            meta_path: dir.join("meta.json"),
            log_path: dir.join("agent.log"),
            dir,
        }
    }
}

pub fn write_iteration(
    paths: &LooperPaths,
    meta: &IterationMeta,
    output: Option<&CapturedOutput>,
) -> Result<IterationPaths> {
    let iter_paths = IterationPaths::new(paths, &meta.session_id, meta.invocation);
    fs::create_dir_all(&iter_paths.dir)
        .with_context(|| format!("create iteration dir {}", iter_paths.dir.display()))?;

    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    fs::write(&iter_paths.meta_path, buf)
        .with_context(|| format!("write {}", iter_paths.meta_path.display()))?;
    if let Some(output) = output {
        fs::write(&iter_paths.log_path, output.render_log())
            .with_context(|| format!("write {}", iter_paths.log_path.display()))?;
    }
    Ok(iter_paths)
}

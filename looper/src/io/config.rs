//! Loop configuration stored under `.looper/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::ExecutionMode;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// sensible values; CLI flags on `looper run` override them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub mode: ExecutionMode,

    /// Upper bound on agent invocations per session (>= 1).
    pub max_iterations: u32,

    /// Sleep between iterations in seconds.
    pub delay_secs: u64,

    /// Consecutive `worked: false` iterations that end an autonomous session (0 disables).
    pub stagnation_threshold: u32,

    /// Grace period between the interrupt signal and the forced kill.
    pub termination_grace_ms: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Key that toggles a pending stop when stdin is a terminal.
    pub stop_key: char,

    pub agent: AgentConfig,
    pub watcher: WatcherConfig,
    pub verification: VerificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command line (e.g. `["claude","--print"]`). The prompt is piped on stdin.
    pub command: Vec<String>,
    /// Flag used to pass the system context. An empty string prepends the
    /// context to the prompt on stdin instead.
    pub system_prompt_flag: String,
    /// Per-invocation wall-clock limit in seconds. Unbounded when unset.
    pub timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            system_prompt_flag: "--append-system-prompt".to_string(),
            timeout_secs: None,
        }
    }
}

impl AgentConfig {
    /// Flag for the system context, or `None` when it goes on stdin.
    pub fn context_flag(&self) -> Option<&str> {
        let flag = self.system_prompt_flag.trim();
        (!flag.is_empty()).then_some(flag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub debounce_ms: u64,
    /// Suppress writes that only touched `lastUpdated`.
    pub meaningful_only: bool,
    pub poll_interval_ms: u64,
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 2000,
            meaningful_only: true,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Run a verification pass when the agent claims completion.
    pub enabled: bool,
    /// Failed verifications that may trigger a resume before giving up.
    pub max_attempts: u32,
    pub resume_on_fail: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 2,
            resume_on_fail: true,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Incremental,
            max_iterations: 25,
            delay_secs: 0,
            stagnation_threshold: 3,
            termination_grace_ms: 5000,
            output_limit_bytes: 100_000,
            stop_key: 's',
            agent: AgentConfig::default(),
            watcher: WatcherConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.termination_grace_ms == 0 {
            return Err(anyhow!("termination_grace_ms must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == Some(0) {
            return Err(anyhow!("agent.timeout_secs must be > 0 when set"));
        }
        if self.watcher.debounce_ms == 0 {
            return Err(anyhow!("watcher.debounce_ms must be > 0"));
        }
        if self.watcher.poll_interval_ms == 0 {
            return Err(anyhow!("watcher.poll_interval_ms must be > 0"));
        }
        if self.stop_key.is_control() {
            return Err(anyhow!("stop_key must be a printable character"));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

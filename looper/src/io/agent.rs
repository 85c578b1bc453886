//! Agent abstraction for one external invocation.
//!
//! The [`Agent`] trait decouples the scheduler from the actual process
//! backend ([`crate::io::process::AgentProcessHandle`]). Tests use scripted
//! agents that return predetermined outcomes without spawning processes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::types::InvocationKind;

/// Which pipe a chunk of agent output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Observer for streamed output, called once per line.
pub type OutputObserver = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

/// Input for one agent invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: InvocationKind,
    pub prompt: String,
    pub system_context: Option<String>,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Bounded stdout/stderr captured from an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CapturedOutput {
    /// Last `max_lines` lines of stderr (or stdout when stderr is empty), for diagnostics.
    pub fn tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }

    /// Render as a log file body with truncation notices.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout);
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[agent stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr);
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[agent stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        buf
    }
}

/// Successful invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub exit: ExitInfo,
    pub output: CapturedOutput,
    pub duration: Duration,
}

/// Failures of a single invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The binary could not be launched. Session-fatal.
    #[error("failed to spawn agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// The agent exited with a failure status. Recoverable.
    #[error("agent exited abnormally ({exit})")]
    NonZeroExit {
        exit: ExitInfo,
        output: CapturedOutput,
        duration: Duration,
    },
    /// `run` was called while another invocation is in flight.
    #[error("agent invocation already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },
    /// Waiting on the child failed after it was spawned.
    #[error("agent process i/o failed: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        output: CapturedOutput,
    },
}

impl AgentError {
    /// Errors that end the session instead of the current iteration.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AgentError::NonZeroExit { .. })
    }

    /// Output captured before the failure, if any.
    pub fn captured_output(&self) -> Option<&CapturedOutput> {
        match self {
            AgentError::NonZeroExit { output, .. } | AgentError::Io { output, .. } => Some(output),
            AgentError::Spawn { .. } | AgentError::AlreadyRunning { .. } => None,
        }
    }
}

/// One external agent, invoked at most once at a time.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run one invocation to completion (or until terminated).
    async fn run(
        &self,
        invocation: &Invocation,
        observer: Option<OutputObserver>,
    ) -> Result<AgentResult, AgentError>;

    /// Graceful-then-forced shutdown of the in-flight invocation. No-op when idle.
    async fn terminate(&self, grace: Duration);

    fn is_running(&self) -> bool;
}

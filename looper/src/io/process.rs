//! Agent process handle: spawn, stream, and graceful-then-forced termination.
//!
//! [`AgentProcessHandle`] is the only owner of the agent's OS process. The
//! child lives inside the `run` future; every other caller sees the coarse
//! [`ChildState`] published through a watch channel, which is also how
//! `terminate` learns that the child has been reaped.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::io::agent::{
    Agent, AgentError, AgentResult, CapturedOutput, ExitInfo, Invocation, OutputObserver,
    OutputStream,
};
use crate::io::config::LoopConfig;

/// Upper bound on waiting for the OS to confirm exit after a forced kill.
const REAP_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on draining pipes after the child exited (grandchildren may hold them open).
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on waiting for an in-progress spawn before terminating.
const SPAWN_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping for the current (or most recent) agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Idle,
    Spawning,
    Running { pid: u32 },
    Terminating { pid: u32 },
    Exited { exit: ExitInfo },
}

impl ChildState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ChildState::Spawning | ChildState::Running { .. } | ChildState::Terminating { .. }
        )
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            ChildState::Running { pid } | ChildState::Terminating { pid } => Some(*pid),
            _ => None,
        }
    }
}

/// Signal delivery failure during shutdown. Logged, never propagated.
#[derive(Debug, Error)]
pub enum TerminationError {
    #[cfg(unix)]
    #[error("failed to send {signal} to process group {pid}: {source}")]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("signal delivery is not supported on this platform")]
    Unsupported,
}

/// How to launch the agent binary.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Flag used to pass the system context; `None` prepends it to stdin.
    pub system_prompt_flag: Option<String>,
    pub output_limit_bytes: usize,
    /// Per-invocation wall-clock limit. Unbounded when `None`.
    pub timeout: Option<Duration>,
    /// Grace period used when the per-invocation timeout fires.
    pub grace: Duration,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            system_prompt_flag: None,
            output_limit_bytes: 100_000,
            timeout: None,
            grace: Duration::from_secs(5),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_config(cfg: &LoopConfig, workdir: impl Into<PathBuf>) -> Self {
        let mut parts = cfg.agent.command.iter().cloned();
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
            workdir: workdir.into(),
            system_prompt_flag: cfg.agent.context_flag().map(str::to_string),
            output_limit_bytes: cfg.output_limit_bytes,
            timeout: cfg.agent.timeout_secs.map(Duration::from_secs),
            grace: cfg.termination_grace(),
        }
    }
}

/// Owns at most one running agent process at a time.
pub struct AgentProcessHandle {
    command: AgentCommand,
    state: watch::Sender<ChildState>,
}

impl AgentProcessHandle {
    pub fn new(command: AgentCommand) -> Self {
        let (state, _) = watch::channel(ChildState::Idle);
        Self { command, state }
    }

    pub fn state(&self) -> ChildState {
        *self.state.borrow()
    }

    /// Claim the handle for a new spawn, failing fast if a child is still active.
    fn begin_spawn(&self) -> Result<(), AgentError> {
        let mut busy: Option<ChildState> = None;
        self.state.send_if_modified(|state| {
            if state.is_active() {
                busy = Some(*state);
                return false;
            }
            *state = ChildState::Spawning;
            true
        });
        match busy {
            Some(state) => Err(AgentError::AlreadyRunning { pid: state.pid() }),
            None => Ok(()),
        }
    }

    fn build_command(&self, invocation: &Invocation) -> (Command, String) {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);

        let mut stdin_payload = invocation.prompt.clone();
        if let Some(context) = &invocation.system_context {
            match &self.command.system_prompt_flag {
                Some(flag) => {
                    cmd.arg(flag).arg(context);
                }
                None => stdin_payload = format!("{context}\n\n{}", invocation.prompt),
            }
        }

        cmd.current_dir(&self.command.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: terminal Ctrl-C reaches only us, and termination
        // signals reach the agent's whole process tree.
        #[cfg(unix)]
        cmd.process_group(0);

        (cmd, stdin_payload)
    }

    /// Wait for the child, enforcing the optional per-invocation timeout.
    async fn wait_with_timeout(
        &self,
        child: &mut Child,
        pid: u32,
    ) -> std::io::Result<(ExitStatus, bool)> {
        let Some(timeout) = self.command.timeout else {
            return child.wait().await.map(|status| (status, false));
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status.map(|status| (status, false)),
            Err(_) => {
                warn!(pid, timeout_secs = timeout.as_secs(), "agent timed out, interrupting");
                self.state.send_replace(ChildState::Terminating { pid });
                if let Err(err) = send_signal(pid, TerminationSignal::Interrupt) {
                    warn!(pid, err = %err, "failed to interrupt timed-out agent");
                }
                if let Ok(status) = tokio::time::timeout(self.command.grace, child.wait()).await {
                    return status.map(|status| (status, true));
                }
                warn!(pid, "timed-out agent ignored interrupt, killing");
                if let Err(err) = send_signal(pid, TerminationSignal::Kill) {
                    warn!(pid, err = %err, "failed to kill process group");
                }
                child.kill().await?;
                child.wait().await.map(|status| (status, true))
            }
        }
    }
}

/// Marks the handle `Exited` if `run` returns early or its future is dropped.
struct ExitGuard<'a> {
    state: &'a watch::Sender<ChildState>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if state.is_active() {
                *state = ChildState::Exited {
                    exit: ExitInfo::default(),
                };
                return true;
            }
            false
        });
    }
}

#[async_trait]
impl Agent for AgentProcessHandle {
    #[instrument(skip_all, fields(kind = ?invocation.kind, program = %self.command.program))]
    async fn run(
        &self,
        invocation: &Invocation,
        observer: Option<OutputObserver>,
    ) -> Result<AgentResult, AgentError> {
        self.begin_spawn()?;
        let _guard = ExitGuard { state: &self.state };
        let started = Instant::now();

        let (mut cmd, stdin_payload) = self.build_command(invocation);
        debug!("spawning agent process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(err = %source, "failed to spawn agent");
                self.state.send_replace(ChildState::Idle);
                return Err(AgentError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            return Err(AgentError::Io {
                source: std::io::Error::other("spawned agent has no pid"),
                output: CapturedOutput::default(),
            });
        };
        self.state.send_replace(ChildState::Running { pid });
        info!(pid, "agent process started");

        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(stdin_payload.as_bytes()).await {
                    debug!(err = %err, "agent closed stdin before reading the prompt");
                }
            })
        });
        let limit = self.command.output_limit_bytes;
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(read_lines_limited(
                stdout,
                limit,
                OutputStream::Stdout,
                observer.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(read_lines_limited(
                stderr,
                limit,
                OutputStream::Stderr,
                observer.clone(),
            ))
        });

        let waited = self.wait_with_timeout(&mut child, pid).await;

        if let Some(task) = stdin_task {
            task.abort();
        }
        let (stdout, stdout_truncated) = drain_output(stdout_task, "stdout").await;
        let (stderr, stderr_truncated) = drain_output(stderr_task, "stderr").await;
        let output = CapturedOutput {
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
        };
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "agent output truncated");
        }

        let (status, timed_out) = match waited {
            Ok(waited) => waited,
            Err(source) => {
                error!(pid, err = %source, "failed waiting for agent process");
                return Err(AgentError::Io { source, output });
            }
        };
        let exit = exit_info(status);
        self.state.send_replace(ChildState::Exited { exit });
        let duration = started.elapsed();
        debug!(
            pid,
            %exit,
            timed_out,
            duration_ms = duration.as_millis() as u64,
            "agent process finished"
        );

        if exit.is_success() && !timed_out {
            return Ok(AgentResult {
                exit,
                output,
                duration,
            });
        }
        warn!(pid, %exit, timed_out, "agent exited abnormally");
        Err(AgentError::NonZeroExit {
            exit,
            output,
            duration,
        })
    }

    #[instrument(skip(self), fields(grace_ms = grace.as_millis() as u64))]
    async fn terminate(&self, grace: Duration) {
        let mut rx = self.state.subscribe();

        // A spawn in flight has no pid yet.
        let spawning = matches!(*rx.borrow_and_update(), ChildState::Spawning);
        if spawning {
            let _ = tokio::time::timeout(
                SPAWN_SETTLE_TIMEOUT,
                rx.wait_for(|state| !matches!(state, ChildState::Spawning)),
            )
            .await;
        }

        let current = self.state();
        let Some(pid) = current.pid() else {
            debug!(state = ?current, "no agent process to terminate");
            return;
        };
        self.state.send_if_modified(|state| {
            if let ChildState::Running { pid } = *state {
                *state = ChildState::Terminating { pid };
                return true;
            }
            false
        });

        info!(pid, "interrupting agent process");
        if let Err(err) = send_signal(pid, TerminationSignal::Interrupt) {
            warn!(pid, err = %err, "failed to interrupt agent process");
        }
        if wait_for_exit(&mut rx, grace).await {
            debug!(pid, "agent process exited after interrupt");
            return;
        }

        warn!(pid, "agent process still running after grace period, killing");
        if let Err(err) = send_signal(pid, TerminationSignal::Kill) {
            warn!(pid, err = %err, "failed to kill agent process");
        }
        if !wait_for_exit(&mut rx, REAP_TIMEOUT).await {
            error!(pid, "agent process did not confirm exit after kill");
        }
    }

    fn is_running(&self) -> bool {
        self.state.borrow().is_active()
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<ChildState>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, rx.wait_for(|state| !state.is_active())).await {
        Ok(result) => result.is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminationSignal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TerminationSignal) -> Result<(), TerminationError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let (sig, name) = match signal {
        TerminationSignal::Interrupt => (Signal::SIGINT, "SIGINT"),
        TerminationSignal::Kill => (Signal::SIGKILL, "SIGKILL"),
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        // Group already gone: treat as terminated.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(TerminationError::Signal {
            pid,
            signal: name,
            source,
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: TerminationSignal) -> Result<(), TerminationError> {
    Err(TerminationError::Unsupported)
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn drain_output(
    task: Option<JoinHandle<std::io::Result<(String, usize)>>>,
    label: &'static str,
) -> (String, usize) {
    let Some(mut task) = task else {
        return (String::new(), 0);
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(err))) => {
            warn!(stream = label, err = %err, "failed reading agent output");
            (String::new(), 0)
        }
        Ok(Err(err)) => {
            warn!(stream = label, err = %err, "agent output reader panicked");
            (String::new(), 0)
        }
        Err(_) => {
            warn!(stream = label, "agent output still open after exit, abandoning");
            task.abort();
            (String::new(), 0)
        }
    }
}

/// Read a stream line by line, forwarding each line to `observer` and keeping
/// at most `limit` bytes (bytes beyond are counted, not stored).
async fn read_lines_limited<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
    stream: OutputStream,
    observer: Option<OutputObserver>,
) -> std::io::Result<(String, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }

        if let Some(observer) = &observer {
            let text = String::from_utf8_lossy(&line);
            observer(stream, text.trim_end_matches(['\r', '\n']));
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((String::from_utf8_lossy(&collected).into_owned(), truncated))
}

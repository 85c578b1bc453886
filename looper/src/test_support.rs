//! Test helpers: a scripted agent and status-artifact fixtures.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::io::agent::{
    Agent, AgentError, AgentResult, CapturedOutput, ExitInfo, Invocation, OutputObserver,
    OutputStream,
};
use crate::io::paths::LooperPaths;
use crate::io::stop::{StopHandle, request_stop_file};

/// How a scripted invocation ends.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Success,
    NonZero(i32),
    /// Behaves like a missing binary.
    SpawnFailure,
    /// Runs until `terminate` is called, then exits as if interrupted.
    Hang,
}

/// Side effects applied while the scripted invocation "runs".
#[derive(Debug, Clone)]
pub enum ScriptedEffect {
    WriteStatus(Value),
    RemoveStatus,
    CreateStopFile,
    ToggleStop(StopHandle),
    WriteReport(String),
    Stdout(String),
    /// Advance the run by this much (virtual) time.
    Sleep(Duration),
}

#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub outcome: ScriptedOutcome,
    pub effects: Vec<ScriptedEffect>,
}

impl ScriptedRun {
    pub fn success(effects: Vec<ScriptedEffect>) -> Self {
        Self {
            outcome: ScriptedOutcome::Success,
            effects,
        }
    }

    pub fn with_outcome(outcome: ScriptedOutcome, effects: Vec<ScriptedEffect>) -> Self {
        Self { outcome, effects }
    }
}

/// Agent that replays queued runs. An empty queue behaves like a successful no-op.
pub struct ScriptedAgent {
    paths: LooperPaths,
    runs: Mutex<VecDeque<ScriptedRun>>,
    invocations: Mutex<Vec<Invocation>>,
    running: AtomicBool,
    terminations: AtomicU32,
    terminated: Notify,
}

impl ScriptedAgent {
    pub fn new(paths: LooperPaths, runs: Vec<ScriptedRun>) -> Self {
        Self {
            paths,
            runs: Mutex::new(runs.into()),
            invocations: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            terminations: AtomicU32::new(0),
            terminated: Notify::new(),
        }
    }

    /// Invocations received so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().expect("invocations lock").clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().expect("invocations lock").len()
    }

    /// `terminate` calls that found a running invocation.
    pub fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }

    fn apply(&self, effect: &ScriptedEffect, observer: Option<&OutputObserver>) {
        match effect {
            ScriptedEffect::WriteStatus(value) => write_status(&self.paths.status_path, value),
            ScriptedEffect::RemoveStatus => {
                let _ = fs::remove_file(&self.paths.status_path);
            }
            ScriptedEffect::CreateStopFile => {
                request_stop_file(&self.paths.stop_path).expect("create stop file");
            }
            ScriptedEffect::ToggleStop(handle) => {
                handle.toggle();
            }
            ScriptedEffect::WriteReport(text) => {
                fs::write(&self.paths.verification_report_path, text).expect("write report");
            }
            ScriptedEffect::Stdout(line) => {
                if let Some(observer) = observer {
                    observer(OutputStream::Stdout, line);
                }
            }
            ScriptedEffect::Sleep(_) => {}
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(
        &self,
        invocation: &Invocation,
        observer: Option<OutputObserver>,
    ) -> Result<AgentResult, AgentError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning { pid: None });
        }
        self.invocations
            .lock()
            .expect("invocations lock")
            .push(invocation.clone());
        let run = self
            .runs
            .lock()
            .expect("runs lock")
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::success(Vec::new()));

        if let ScriptedOutcome::SpawnFailure = run.outcome {
            self.running.store(false, Ordering::SeqCst);
            return Err(AgentError::Spawn {
                program: "scripted-agent".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        for effect in &run.effects {
            match effect {
                ScriptedEffect::Sleep(duration) => tokio::time::sleep(*duration).await,
                effect => self.apply(effect, observer.as_ref()),
            }
        }
        // Let background listeners observe the effects mid-run.
        tokio::task::yield_now().await;

        let result = match run.outcome {
            ScriptedOutcome::Success => Ok(AgentResult {
                exit: ExitInfo::success(),
                output: CapturedOutput::default(),
                duration: Duration::from_millis(10),
            }),
            ScriptedOutcome::NonZero(code) => Err(AgentError::NonZeroExit {
                exit: ExitInfo {
                    code: Some(code),
                    signal: None,
                },
                output: CapturedOutput {
                    stderr: format!("scripted failure {code}\n"),
                    ..CapturedOutput::default()
                },
                duration: Duration::from_millis(10),
            }),
            ScriptedOutcome::Hang => {
                self.terminated.notified().await;
                Err(AgentError::NonZeroExit {
                    exit: ExitInfo {
                        code: None,
                        signal: Some(2),
                    },
                    output: CapturedOutput::default(),
                    duration: Duration::from_millis(10),
                })
            }
            ScriptedOutcome::SpawnFailure => unreachable!("handled above"),
        };
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn terminate(&self, _grace: Duration) {
        if self.running.load(Ordering::SeqCst) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            self.terminated.notify_one();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Write a status artifact as compact JSON.
pub fn write_status(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create status dir");
    }
    fs::write(path, value.to_string()).expect("write status");
}

pub fn incremental_status(completed: u64, total: u64, complete: bool) -> Value {
    json!({
        "complete": complete,
        "progress": { "completed": completed, "total": total },
        "lastUpdated": chrono::Utc::now().to_rfc3339(),
    })
}

pub fn autonomous_status(worked: bool, complete: bool) -> Value {
    json!({
        "complete": complete,
        "worked": worked,
        "lastUpdated": chrono::Utc::now().to_rfc3339(),
    })
}

/// Temporary task directory with `.looper/` and instructions in place.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    pub paths: LooperPaths,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self::with_instructions("Implement the feature described here.\n")
    }

    pub fn with_instructions(instructions: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LooperPaths::new(temp.path());
        fs::create_dir_all(&paths.state_dir).expect("create state dir");
        fs::write(&paths.instructions_path, instructions).expect("write instructions");
        Self { _temp: temp, paths }
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

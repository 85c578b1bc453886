//! Iteration scheduler: the session loop around the agent.
//!
//! One agent invocation runs at a time. The status artifact is re-read after
//! every invocation, and stagnation, completion and stop requests are decided
//! only at that boundary. The process-level interrupt is the one exception: it
//! terminates the in-flight child immediately.
//!
//! Whatever way the loop ends, [`IterationScheduler::run`] terminates the
//! agent, stops the change watcher and restores the terminal before returning.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::decision::{BoundaryDecision, StagnationTracker, evaluate_boundary};
use crate::core::stats::IterationStats;
use crate::core::types::{ExecutionMode, ExitReason, InvocationKind, SessionState};
use crate::core::verdict::VerificationReport;
use crate::io::agent::{Agent, AgentError, AgentResult, Invocation, OutputObserver};
use crate::io::config::LoopConfig;
use crate::io::iteration_log::{IterationMeta, write_iteration};
use crate::io::paths::LooperPaths;
use crate::io::prompt::{PromptSource, read_instructions};
use crate::io::session_state::{SessionRecord, new_session_id, write_session};
use crate::io::status_store::StatusStore;
use crate::io::stop::StopSignal;
use crate::io::watcher::{ChangeSink, ChangeWatcher};
use crate::verify::{VerificationCycle, VerifyStep, clear_stale_report, read_report};

/// Mutable bookkeeping for one run of the scheduler.
#[derive(Debug)]
pub struct ExecutionSession {
    pub id: String,
    pub mode: ExecutionMode,
    /// Completed budgeted invocations (iterations and resumes).
    pub iteration_index: u32,
    pub max_iterations: u32,
    pub delay: Duration,
    pub state: SessionState,
    /// Every agent invocation, including verification passes.
    pub invocations: u32,
    pub stagnation: StagnationTracker,
    pub verification: VerificationCycle,
    pub stats: IterationStats,
    pub started_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    pub last_summary: Option<String>,
    /// Tail of the agent's output from a fatal invocation.
    pub diagnostic: Option<String>,
    /// Gaps from a failed verification, consumed by the next iteration.
    pending_gaps: Option<Vec<String>>,
}

impl ExecutionSession {
    pub fn new(id: String, config: &LoopConfig) -> Self {
        Self {
            id,
            mode: config.mode,
            iteration_index: 0,
            max_iterations: config.max_iterations,
            delay: config.delay(),
            state: SessionState::Starting,
            invocations: 0,
            stagnation: StagnationTracker::new(config.stagnation_threshold),
            verification: VerificationCycle::new(&config.verification),
            stats: IterationStats::new(),
            started_at: Utc::now(),
            exit_reason: None,
            last_summary: None,
            diagnostic: None,
            pending_gaps: None,
        }
    }

    pub fn budget_left(&self) -> bool {
        self.iteration_index < self.max_iterations
    }

    pub fn record(&self) -> SessionRecord {
        let remaining = self.max_iterations.saturating_sub(self.iteration_index);
        SessionRecord {
            state: self.state,
            exit_reason: self.exit_reason.clone(),
            iteration_index: self.iteration_index,
            stagnation_count: self.stagnation.count(),
            verification_attempts: self.verification.attempts(),
            started_at: self.started_at,
            average_iteration_secs: self.stats.rolling_average().map(|d| d.as_secs_f64()),
            eta_secs: self.stats.eta(remaining).map(|d| d.as_secs_f64()),
            last_summary: self.last_summary.clone(),
            ..SessionRecord::new(self.id.clone(), self.mode, self.max_iterations)
        }
    }
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub reason: ExitReason,
    pub iterations: u32,
    pub invocations: u32,
    pub verification_attempts: u32,
    pub verification: Option<VerificationReport>,
    /// Tail of the agent's output when the session ended on a fatal error.
    pub diagnostic: Option<String>,
}

/// How one invocation ended, from the loop's point of view.
enum Invoked {
    Finished { success: bool },
    Interrupted,
    Fatal(AgentError),
}

const DIAGNOSTIC_LINES: usize = 20;

pub struct IterationScheduler<A: Agent, P: PromptSource> {
    agent: A,
    prompts: P,
    config: LoopConfig,
    paths: LooperPaths,
    store: Arc<StatusStore>,
    stop: StopSignal,
    sinks: Vec<Arc<dyn ChangeSink>>,
    observer: Option<OutputObserver>,
    interrupt: CancellationToken,
}

impl<A: Agent, P: PromptSource> IterationScheduler<A, P> {
    pub fn new(agent: A, prompts: P, config: LoopConfig, paths: LooperPaths) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(StatusStore::new(&paths.status_path, config.mode)?);
        let stop = StopSignal::new(&paths.stop_path, config.stop_key)
            .with_poll_interval(config.watcher.poll_interval());
        Ok(Self {
            agent,
            prompts,
            config,
            paths,
            store,
            stop,
            sinks: Vec::new(),
            observer: None,
            interrupt: CancellationToken::new(),
        })
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_output_observer(mut self, observer: OutputObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Token that, once cancelled, terminates the in-flight agent and ends the session.
    pub fn with_interrupt(mut self, interrupt: CancellationToken) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn status_store(&self) -> Arc<StatusStore> {
        self.store.clone()
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Run the session to a terminal state.
    ///
    /// Errors only for setup problems detected before any agent runs
    /// (missing instructions, unrenderable templates).
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        let instructions = read_instructions(&self.paths.instructions_path)?;
        let system_context = self
            .prompts
            .system_context(self.config.mode, &self.paths.status_path)?;

        let mut session = ExecutionSession::new(new_session_id(Utc::now()), &self.config);
        info!(
            session_id = %session.id,
            mode = %session.mode,
            max_iterations = session.max_iterations,
            verify = session.verification.enabled(),
            "session starting"
        );

        self.stop.init();
        let watcher = self.config.watcher.enabled.then(|| {
            ChangeWatcher::spawn(self.store.clone(), &self.config.watcher, self.sinks.clone())
        });
        self.persist(&session);

        let reason = self.drive(&mut session, &instructions, &system_context).await;

        // Cleanup runs on every exit path.
        self.agent.terminate(self.config.termination_grace()).await;
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        self.stop.cleanup(true);

        session.state = reason.terminal_state();
        session.exit_reason = Some(reason.clone());
        self.persist(&session);
        match &reason {
            ExitReason::Fatal { .. } => error!(session_id = %session.id, %reason, "session failed"),
            ExitReason::NeedsReview { .. } => {
                warn!(session_id = %session.id, %reason, "session finished")
            }
            _ => info!(session_id = %session.id, %reason, "session finished"),
        }

        Ok(SessionOutcome {
            session_id: session.id.clone(),
            state: session.state,
            reason,
            iterations: session.iteration_index,
            invocations: session.invocations,
            verification_attempts: session.verification.attempts(),
            verification: session.verification.last_report().cloned(),
            diagnostic: session.diagnostic.take(),
        })
    }

    async fn drive(
        &self,
        session: &mut ExecutionSession,
        instructions: &str,
        system_context: &str,
    ) -> ExitReason {
        session.state = SessionState::Running;
        self.persist(session);

        loop {
            if self.interrupt.is_cancelled() {
                return ExitReason::Interrupted;
            }
            if !session.budget_left() {
                return ExitReason::BudgetExhausted {
                    iterations: session.iteration_index,
                };
            }

            let (kind, prompt) = match session.pending_gaps.take() {
                Some(gaps) => (
                    InvocationKind::Resume,
                    self.prompts.resume_prompt(
                        session.mode,
                        session.iteration_index,
                        instructions,
                        &gaps,
                    ),
                ),
                None => (
                    InvocationKind::Iteration,
                    self.prompts
                        .iteration_prompt(session.mode, session.iteration_index, instructions),
                ),
            };
            let prompt = match prompt {
                Ok(prompt) => prompt,
                Err(err) => return fatal(format!("build prompt: {err:#}")),
            };
            let invocation = Invocation {
                kind,
                prompt,
                system_context: Some(system_context.to_string()),
            };

            match self.invoke(session, &invocation).await {
                Invoked::Finished { .. } => {}
                Invoked::Interrupted => return ExitReason::Interrupted,
                Invoked::Fatal(err) => return fatal(err.to_string()),
            }
            session.iteration_index += 1;

            let snapshot = self.store.read();
            for warning in snapshot.consistency_warnings() {
                warn!("status consistency: {warning}");
            }
            session.last_summary = snapshot.summary.clone();
            let stop_requested = self.stop.is_stop_requested();
            debug!(stop_requested, "boundary stop check");
            let decision = evaluate_boundary(
                session.mode,
                &snapshot,
                &mut session.stagnation,
                self.stop.state(),
            );
            self.log_boundary(session, snapshot.remaining(), decision);
            self.persist(session);

            match decision {
                BoundaryDecision::Continue => {}
                BoundaryDecision::Complete => {
                    if !session.verification.enabled() {
                        return ExitReason::Completed;
                    }
                    match self.verify(session, instructions, system_context).await {
                        VerifyStep::Finished(reason) => return reason,
                        VerifyStep::Resume(gaps) => {
                            session.pending_gaps = Some(gaps);
                            session.state = SessionState::Running;
                            self.persist(session);
                        }
                    }
                }
                BoundaryDecision::Stagnated { consecutive } => {
                    return ExitReason::Stagnation { consecutive };
                }
                BoundaryDecision::Stop { source } => return ExitReason::StopRequested { source },
            }

            if !session.budget_left() {
                return ExitReason::BudgetExhausted {
                    iterations: session.iteration_index,
                };
            }
            if !session.delay.is_zero() {
                debug!(delay_secs = session.delay.as_secs(), "sleeping before next iteration");
                tokio::select! {
                    _ = self.interrupt.cancelled() => return ExitReason::Interrupted,
                    _ = tokio::time::sleep(session.delay) => {}
                }
            }
        }
    }

    async fn verify(
        &self,
        session: &mut ExecutionSession,
        instructions: &str,
        system_context: &str,
    ) -> VerifyStep {
        session.state = SessionState::Verifying;
        self.persist(session);
        info!(
            attempt = session.verification.attempts() + 1,
            "agent reports completion, verifying"
        );

        let report_path = self.paths.verification_report_path.clone();
        clear_stale_report(&report_path);
        let prompt = match self.prompts.verification_prompt(instructions, &report_path) {
            Ok(prompt) => prompt,
            Err(err) => {
                return VerifyStep::Finished(fatal(format!("build verification prompt: {err:#}")));
            }
        };
        let invocation = Invocation {
            kind: InvocationKind::Verification,
            prompt,
            system_context: Some(system_context.to_string()),
        };

        let report = match self.invoke(session, &invocation).await {
            Invoked::Finished { success: true } => read_report(&report_path),
            Invoked::Finished { success: false } => {
                VerificationReport::unreadable("verification agent exited abnormally")
            }
            Invoked::Interrupted => return VerifyStep::Finished(ExitReason::Interrupted),
            Invoked::Fatal(err) => return VerifyStep::Finished(fatal(err.to_string())),
        };
        info!(
            verdict = ?report.verdict,
            confidence = report.confidence.as_deref().unwrap_or("-"),
            summary = report.summary.as_deref().unwrap_or("-"),
            gaps = report.gaps.len(),
            "verification report"
        );
        let budget_left = session.budget_left();
        session.verification.decide(report, budget_left)
    }

    /// Run one invocation, racing it against the interrupt token.
    async fn invoke(&self, session: &mut ExecutionSession, invocation: &Invocation) -> Invoked {
        session.invocations += 1;
        let grace = self.config.termination_grace();
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        info!(
            invocation = session.invocations,
            iteration = session.iteration_index + 1,
            kind = ?invocation.kind,
            "invoking agent"
        );

        let run = self.agent.run(invocation, self.observer.clone());
        tokio::pin!(run);
        let mut interrupted = false;
        let result = tokio::select! {
            result = &mut run => result,
            _ = self.interrupt.cancelled() => {
                interrupted = true;
                warn!("interrupt received, terminating agent");
                // Keep driving the run future so the child is reaped.
                let (result, ()) = tokio::join!(&mut run, self.agent.terminate(grace));
                result
            }
        };
        let duration = started.elapsed();
        self.log_invocation(session, invocation.kind, started_at, duration, &result);
        let finished = matches!(&result, Ok(_) | Err(AgentError::NonZeroExit { .. }));
        if finished && invocation.kind.is_budgeted() {
            session.stats.record(duration);
        }

        match result {
            Ok(done) => {
                debug!(
                    exit = %done.exit,
                    duration_ms = duration.as_millis() as u64,
                    "agent finished"
                );
            }
            Err(AgentError::NonZeroExit { exit, output, .. }) => {
                if !interrupted {
                    warn!(%exit, tail = %output.tail(5), "agent exited abnormally, continuing");
                }
                return if interrupted {
                    Invoked::Interrupted
                } else {
                    Invoked::Finished { success: false }
                };
            }
            Err(err) => {
                error!(err = %err, "agent invocation failed");
                session.diagnostic = err
                    .captured_output()
                    .map(|output| output.tail(DIAGNOSTIC_LINES))
                    .filter(|tail| !tail.is_empty());
                return if interrupted {
                    Invoked::Interrupted
                } else {
                    Invoked::Fatal(err)
                };
            }
        }
        if interrupted {
            return Invoked::Interrupted;
        }
        Invoked::Finished { success: true }
    }

    fn log_invocation(
        &self,
        session: &ExecutionSession,
        kind: InvocationKind,
        started_at: DateTime<Utc>,
        duration: Duration,
        result: &Result<AgentResult, AgentError>,
    ) {
        let (exit, output, error) = match result {
            Ok(done) => (Some(done.exit), Some(&done.output), None),
            Err(AgentError::NonZeroExit { exit, output, .. }) => (Some(*exit), Some(output), None),
            Err(err) => (None, err.captured_output(), Some(err.to_string())),
        };
        let meta = IterationMeta {
            session_id: session.id.clone(),
            invocation: session.invocations,
            kind,
            iteration_index: session.iteration_index,
            exit_code: exit.and_then(|e| e.code),
            exit_signal: exit.and_then(|e| e.signal),
            error,
            started_at,
            ended_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        };
        if let Err(err) = write_iteration(&self.paths, &meta, output) {
            warn!(err = %format!("{err:#}"), "failed to write iteration log");
        }
    }

    fn log_boundary(
        &self,
        session: &ExecutionSession,
        remaining: Option<u64>,
        decision: BoundaryDecision,
    ) {
        let left = session.max_iterations.saturating_sub(session.iteration_index);
        info!(
            iteration = session.iteration_index,
            max_iterations = session.max_iterations,
            remaining_work = ?remaining,
            stagnation = session.stagnation.count(),
            elapsed_secs = session.stats.elapsed().as_secs(),
            avg_secs = ?session.stats.rolling_average().map(|d| d.as_secs()),
            eta_secs = ?session.stats.eta(left).map(|d| d.as_secs()),
            decision = ?decision,
            "iteration boundary"
        );
    }

    fn persist(&self, session: &ExecutionSession) {
        if let Err(err) = write_session(&self.paths.session_path, &session.record()) {
            warn!(err = %format!("{err:#}"), "failed to persist session record");
        }
    }
}

fn fatal(message: String) -> ExitReason {
    ExitReason::Fatal { message }
}

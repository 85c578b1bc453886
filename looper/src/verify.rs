//! Bounded verify/resume cycle entered when the agent claims completion.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::core::types::ExitReason;
use crate::core::verdict::{Verdict, VerificationReport, parse_report};
use crate::io::config::VerificationConfig;

/// What the scheduler does after a verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStep {
    /// Session ends with this reason (`Completed` or `NeedsReview`).
    Finished(ExitReason),
    /// Re-enter the loop with a resume prompt built from these gaps.
    Resume(Vec<String>),
}

/// Tracks failed verifications across one session. The attempt bound is absolute.
#[derive(Debug, Clone)]
pub struct VerificationCycle {
    enabled: bool,
    max_attempts: u32,
    resume_on_fail: bool,
    attempts: u32,
    last_report: Option<VerificationReport>,
}

impl VerificationCycle {
    pub fn new(cfg: &VerificationConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            max_attempts: cfg.max_attempts,
            resume_on_fail: cfg.resume_on_fail,
            attempts: 0,
            last_report: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Failed verifications that triggered a resume.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_report(&self) -> Option<&VerificationReport> {
        self.last_report.as_ref()
    }

    /// Decide the next step from a report. `budget_left` is false when no
    /// iteration remains for a resume.
    pub fn decide(&mut self, report: VerificationReport, budget_left: bool) -> VerifyStep {
        let summary = report.summary.clone();
        let step = match report.verdict {
            Verdict::Pass => VerifyStep::Finished(ExitReason::Completed),
            Verdict::NeedsReview => VerifyStep::Finished(ExitReason::NeedsReview {
                detail: summary.unwrap_or_else(|| "verifier requested manual review".to_string()),
            }),
            Verdict::Fail => self.on_failure(&report, budget_left),
        };
        self.last_report = Some(report);
        step
    }

    fn on_failure(&mut self, report: &VerificationReport, budget_left: bool) -> VerifyStep {
        let summary = report
            .summary
            .as_deref()
            .unwrap_or("no summary given");
        if !self.resume_on_fail {
            return needs_review(format!("verification failed: {summary}"));
        }
        if self.attempts >= self.max_attempts {
            warn!(attempts = self.attempts, "verification attempts exhausted");
            return needs_review(format!(
                "verification still failing after {} resume attempts: {summary}",
                self.attempts
            ));
        }
        if !budget_left {
            warn!("verification failed with no iterations left for a resume");
            return needs_review(format!(
                "verification failed and the iteration budget is spent: {summary}"
            ));
        }
        self.attempts += 1;
        info!(
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            gaps = report.gaps.len(),
            "verification failed, resuming"
        );
        VerifyStep::Resume(report.gaps.clone())
    }
}

fn needs_review(detail: String) -> VerifyStep {
    VerifyStep::Finished(ExitReason::NeedsReview { detail })
}

/// Remove a report left by an earlier pass so a silent verifier is not misread.
pub fn clear_stale_report(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale verification report"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            path = %path.display(),
            err = %err,
            "failed to remove stale verification report"
        ),
    }
}

/// Parse the report the verifier wrote. Missing or unreadable means manual review.
pub fn read_report(path: &Path) -> VerificationReport {
    match fs::read_to_string(path) {
        Ok(text) => parse_report(&text),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "verification report unreadable");
            VerificationReport::unreadable("verification report was not written")
        }
    }
}

//! Verification report parsing.
//!
//! The report is free-form markdown. Only a few markers are read:
//! `VERDICT: pass|fail|needs_review`, `CONFIDENCE: ...`, `SUMMARY: ...`, and
//! bullet items under a `## Gaps` heading.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_>#-]*verdict[\s*_]*[:=][\s*_]*(pass|fail|needs[ _-]?review)\b")
        .expect("verdict regex should be valid")
});
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_>#-]*confidence[\s*_]*[:=][\s*_]*(.+?)\s*$")
        .expect("confidence regex should be valid")
});
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*_>#-]*summary[\s*_]*[:=][\s*_]*(.+?)\s*$")
        .expect("summary regex should be valid")
});
static GAPS_HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#+\s*gaps\b").expect("gaps regex should be valid"));
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+?)\s*$").expect("bullet regex should be valid")
});

/// Verdict tag of a verification report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    NeedsReview,
}

/// Markers extracted from a verification report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub verdict: Verdict,
    pub confidence: Option<String>,
    pub summary: Option<String>,
    pub gaps: Vec<String>,
}

impl VerificationReport {
    /// Report used when the verifier produced nothing readable.
    pub fn unreadable(reason: &str) -> Self {
        Self {
            verdict: Verdict::NeedsReview,
            confidence: None,
            summary: Some(reason.to_string()),
            gaps: Vec::new(),
        }
    }
}

/// Parse report text. A missing or unknown verdict marker means `NeedsReview`.
pub fn parse_report(text: &str) -> VerificationReport {
    let verdict = VERDICT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| classify(m.as_str()))
        .unwrap_or(Verdict::NeedsReview);
    let confidence = first_capture(&CONFIDENCE_RE, text);
    let summary = first_capture(&SUMMARY_RE, text);

    VerificationReport {
        verdict,
        confidence,
        summary,
        gaps: parse_gaps(text),
    }
}

fn classify(tag: &str) -> Verdict {
    let tag = tag.to_ascii_lowercase();
    if tag == "pass" {
        Verdict::Pass
    } else if tag == "fail" {
        Verdict::Fail
    } else {
        Verdict::NeedsReview
    }
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim_matches(|c| c == '*' || c == '_').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_gaps(text: &str) -> Vec<String> {
    let mut gaps = Vec::new();
    let mut in_gaps = false;
    for line in text.lines() {
        if line.trim_start().starts_with('#') {
            in_gaps = GAPS_HEADING_RE.is_match(line.trim_start());
            continue;
        }
        if !in_gaps {
            continue;
        }
        if let Some(caps) = BULLET_RE.captures(line) {
            gaps.push(caps[1].to_string());
        }
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILING_REPORT: &str = "\
# Verification Report

**VERDICT:** FAIL
CONFIDENCE: high
SUMMARY: two deliverables are missing

## Checked
- README exists

## Gaps
- no integration tests for the parser
- CHANGELOG not updated

## Notes
- unrelated bullet
";

    #[test]
    fn parses_failing_report_with_gaps() {
        let report = parse_report(FAILING_REPORT);
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.confidence.as_deref(), Some("high"));
        assert_eq!(
            report.summary.as_deref(),
            Some("two deliverables are missing")
        );
        assert_eq!(
            report.gaps,
            vec![
                "no integration tests for the parser".to_string(),
                "CHANGELOG not updated".to_string()
            ]
        );
    }

    #[test]
    fn verdict_tags_are_case_insensitive() {
        assert_eq!(parse_report("verdict: pass").verdict, Verdict::Pass);
        assert_eq!(parse_report("VERDICT = Needs-Review").verdict, Verdict::NeedsReview);
        assert_eq!(parse_report("Verdict: needs_review").verdict, Verdict::NeedsReview);
    }

    #[test]
    fn missing_verdict_needs_review() {
        let report = parse_report("looks fine to me");
        assert_eq!(report.verdict, Verdict::NeedsReview);
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn verdict_must_start_a_line() {
        let report = parse_report("the expected verdict: pass was not reached");
        assert_eq!(report.verdict, Verdict::NeedsReview);
    }
}

//! Defensive reader for the agent-written status artifact.
//!
//! The agent is only partly trusted: a missing, truncated, mistyped or
//! schema-violating file is logged and replaced by the mode's default
//! snapshot. [`StatusStore::read`] never fails.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::core::status::{RawStatus, StatusSnapshot};
use crate::core::types::ExecutionMode;

/// JSON Schema for `status.json`, also written to `.looper/` by `looper init`.
pub const STATUS_SCHEMA: &str = include_str!("../../schemas/status.schema.json");

/// Why a status artifact could not be used. Never propagated out of `read()`.
#[derive(Debug, Error)]
pub enum StatusParseError {
    #[error("status file {} does not exist", .path.display())]
    Missing { path: PathBuf },
    #[error("failed to read status file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("status file {} is not valid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("status file {} violates schema: {}", .path.display(), .messages.join("; "))]
    Schema { path: PathBuf, messages: Vec<String> },
}

/// Advisory diagnostics from [`StatusStore::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct StatusStore {
    path: PathBuf,
    mode: ExecutionMode,
    validator: Validator,
    reads: AtomicU64,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>, mode: ExecutionMode) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(STATUS_SCHEMA).context("parse embedded status schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile status schema")?;
        Ok(Self {
            path: path.into(),
            mode,
            validator,
            reads: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of read attempts so far (checked or not).
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Fresh snapshot, or the default snapshot when the artifact is unusable.
    pub fn read(&self) -> StatusSnapshot {
        match self.read_checked() {
            Ok(snapshot) => snapshot,
            Err(StatusParseError::Missing { path }) => {
                warn!(path = %path.display(), "status file missing, using default snapshot");
                StatusSnapshot::default_for(self.mode)
            }
            Err(err) => {
                warn!(err = %err, "unusable status file, using default snapshot");
                StatusSnapshot::default_for(self.mode)
            }
        }
    }

    /// Like [`read`](Self::read) but reports why the artifact was rejected.
    pub fn read_checked(&self) -> Result<StatusSnapshot, StatusParseError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StatusParseError::Missing {
                    path: self.path.clone(),
                });
            }
            Err(source) => {
                return Err(StatusParseError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let value: Value =
            serde_json::from_str(&contents).map_err(|source| StatusParseError::Json {
                path: self.path.clone(),
                source,
            })?;

        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(StatusParseError::Schema {
                path: self.path.clone(),
                messages,
            });
        }

        let raw: RawStatus =
            serde_json::from_value(value).map_err(|source| StatusParseError::Json {
                path: self.path.clone(),
                source,
            })?;
        Ok(StatusSnapshot::from_raw(raw, self.mode))
    }

    pub fn is_complete(&self) -> bool {
        self.read().complete
    }

    /// Outstanding work items, or `None` when the mode has no progress concept.
    pub fn compute_remaining(&self) -> Option<u64> {
        self.read().remaining()
    }

    pub fn validate(&self) -> ValidationReport {
        let warnings = self.read().consistency_warnings();
        for warning in &warnings {
            warn!(path = %self.path.display(), "status consistency: {warning}");
        }
        ValidationReport { warnings }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tracing::Level;
    use tracing_subscriber::Layer;
    use tracing_subscriber::layer::{self, SubscriberExt};

    use super::*;
    use crate::core::status::Progress;

    fn store(mode: ExecutionMode) -> (tempfile::TempDir, StatusStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = StatusStore::new(temp.path().join("status.json"), mode).expect("store");
        (temp, store)
    }

    fn write(store: &StatusStore, contents: &str) {
        fs::write(store.path(), contents).expect("write status");
    }

    #[test]
    fn reads_valid_incremental_status() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        write(
            &store,
            r#"{"complete":false,"progress":{"completed":3,"total":8},"summary":"halfway"}"#,
        );
        let snapshot = store.read();
        assert!(!snapshot.complete);
        assert_eq!(
            snapshot.progress(),
            Some(Progress {
                completed: 3,
                total: 8
            })
        );
        assert_eq!(store.compute_remaining(), Some(5));
        assert_eq!(snapshot.summary.as_deref(), Some("halfway"));
    }

    #[test]
    fn missing_file_returns_default() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        assert_eq!(
            store.read(),
            StatusSnapshot::default_for(ExecutionMode::Incremental)
        );
        assert!(matches!(
            store.read_checked(),
            Err(StatusParseError::Missing { .. })
        ));
        assert!(!store.is_complete());
    }

    struct LevelRecorder(Arc<Mutex<Vec<Level>>>);

    impl<S: tracing::Subscriber> Layer<S> for LevelRecorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            self.0.lock().expect("levels").push(*event.metadata().level());
        }
    }

    #[test]
    fn missing_file_logs_a_warning() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        let levels = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(LevelRecorder(levels.clone()));
        tracing::subscriber::with_default(subscriber, || {
            store.read();
        });
        assert!(levels.lock().expect("levels").contains(&Level::WARN));
    }

    #[test]
    fn malformed_inputs_return_default() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        let default = StatusSnapshot::default_for(ExecutionMode::Incremental);
        let cases = [
            r#"{"complete": tru"#,
            "",
            "[]",
            r#"{"progress":{"completed":1,"total":2}}"#,
            r#"{"complete":"yes"}"#,
            r#"{"complete":false,"progress":{"completed":-1,"total":2}}"#,
            r#"{"complete":false,"progress":{"completed":1}}"#,
            r#"{"complete":false,"blockers":"none"}"#,
        ];
        for case in cases {
            write(&store, case);
            assert_eq!(store.read(), default, "input: {case}");
            assert!(store.read_checked().is_err(), "input: {case}");
        }
    }

    #[test]
    fn schema_errors_are_reported() {
        let (_temp, store) = store(ExecutionMode::Autonomous);
        write(&store, r#"{"complete":1,"worked":"no"}"#);
        match store.read_checked() {
            Err(StatusParseError::Schema { messages, .. }) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn autonomous_remaining_is_none() {
        let (_temp, store) = store(ExecutionMode::Autonomous);
        write(&store, r#"{"complete":false,"worked":true}"#);
        assert_eq!(store.read().worked(), Some(true));
        assert_eq!(store.compute_remaining(), None);
    }

    #[test]
    fn validate_reports_inconsistent_progress() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        write(
            &store,
            r#"{"complete":true,"progress":{"completed":4,"total":5}}"#,
        );
        let report = store.validate();
        assert_eq!(report.warnings, vec!["complete=true but progress is 4/5"]);

        write(
            &store,
            r#"{"complete":true,"progress":{"completed":5,"total":5}}"#,
        );
        assert!(store.validate().is_clean());
    }

    #[test]
    fn every_read_is_counted() {
        let (_temp, store) = store(ExecutionMode::Incremental);
        store.read();
        store.is_complete();
        assert_eq!(store.read_count(), 2);
    }
}

//! Debounced, filtered change notifications for the status artifact.
//!
//! Raw filesystem events only reset a debounce deadline. When the deadline
//! passes without another event the artifact is re-read, diffed against the
//! last emitted snapshot, and (unless the write was cosmetic) delivered to
//! every registered [`ChangeSink`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{Event as NotifyEvent, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::delta::{ChangeEvent, should_emit};
use crate::core::status::StatusSnapshot;
use crate::io::config::WatcherConfig;
use crate::io::status_store::{StatusParseError, StatusStore};

const RAW_EVENT_BUFFER: usize = 64;

/// Receives debounced change notifications.
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Logs one line per change.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ChangeSink for LogSink {
    fn on_change(&self, event: &ChangeEvent) {
        let progress = event
            .current
            .progress()
            .map(|p| format!("{}/{}", p.completed, p.total));
        info!(
            complete = event.current.complete,
            progress = progress.as_deref().unwrap_or("-"),
            worked = ?event.current.worked(),
            completed_delta = event.delta.completed_delta,
            summary = event.current.summary.as_deref().unwrap_or(""),
            "status changed"
        );
    }
}

impl ChangeSink for mpsc::UnboundedSender<ChangeEvent> {
    fn on_change(&self, event: &ChangeEvent) {
        if self.send(event.clone()).is_err() {
            debug!("change receiver dropped");
        }
    }
}

/// Background watcher over one status artifact. Stops on [`shutdown`](Self::shutdown) or drop.
pub struct ChangeWatcher {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeWatcher {
    /// Subscribe to filesystem events for the store's path and start debouncing.
    pub fn spawn(
        store: Arc<StatusStore>,
        cfg: &WatcherConfig,
        sinks: Vec<Arc<dyn ChangeSink>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(RAW_EVENT_BUFFER);
        let mut watcher = Self::from_raw_events(store.clone(), cfg, sinks, rx);
        let subscription = tokio::spawn(subscribe(
            store.path().to_path_buf(),
            cfg.poll_interval(),
            tx,
            watcher.cancel.clone(),
        ));
        watcher.tasks.push(subscription);
        watcher
    }

    /// Debounce an already-established stream of raw write notifications.
    fn from_raw_events(
        store: Arc<StatusStore>,
        cfg: &WatcherConfig,
        sinks: Vec<Arc<dyn ChangeSink>>,
        raw_events: mpsc::Receiver<()>,
    ) -> Self {
        let cancel = CancellationToken::new();
        // No baseline read: the artifact is untouched until a write is observed.
        let debouncer = Debouncer {
            store,
            debounce: cfg.debounce(),
            meaningful_only: cfg.meaningful_only,
            sinks,
            last_emitted: None,
        };
        let task = tokio::spawn(debouncer.run(raw_events, cancel.clone()));
        Self {
            cancel,
            tasks: vec![task],
        }
    }

    /// Cancel pending debounce timers and release the filesystem subscription.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(err = %err, "change watcher task failed");
            }
        }
        debug!("change watcher stopped");
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Debouncer {
    store: Arc<StatusStore>,
    debounce: Duration,
    meaningful_only: bool,
    sinks: Vec<Arc<dyn ChangeSink>>,
    last_emitted: Option<StatusSnapshot>,
}

impl Debouncer {
    async fn run(mut self, mut raw_events: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut deadline: Option<Instant> = None;
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = raw_events.recv(), if events_open => match received {
                    Some(()) => deadline = Some(Instant::now() + self.debounce),
                    None => events_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    deadline = None;
                    self.flush();
                }
            }
        }
    }

    fn flush(&mut self) {
        let current = match self.store.read_checked() {
            Ok(snapshot) => snapshot,
            Err(StatusParseError::Missing { .. }) => return,
            Err(err) => {
                // Agents often write in several steps; wait for the next event.
                debug!(err = %err, "status not readable after write, skipping");
                return;
            }
        };
        if !should_emit(self.last_emitted.as_ref(), &current, self.meaningful_only) {
            debug!("cosmetic status write suppressed");
            return;
        }
        let event = ChangeEvent::new(self.last_emitted.take(), current.clone(), Utc::now());
        for sink in &self.sinks {
            sink.on_change(&event);
        }
        self.last_emitted = Some(current);
    }
}

/// Keep a poll watcher on the artifact's directory, retrying until it exists.
async fn subscribe(
    path: PathBuf,
    poll_interval: Duration,
    tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    loop {
        match watch_parent(&path, poll_interval, tx.clone()) {
            Ok(watcher) => {
                debug!(path = %path.display(), "watching status file");
                cancel.cancelled().await;
                drop(watcher);
                return;
            }
            Err(err) => debug!(
                path = %path.display(),
                err = %err,
                "status watch unavailable, retrying"
            ),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn watch_parent(
    path: &Path,
    poll_interval: Duration,
    tx: mpsc::Sender<()>,
) -> notify::Result<PollWatcher> {
    let parent = path
        .parent()
        .filter(|parent| parent.is_dir())
        .ok_or_else(|| notify::Error::generic("status directory does not exist"))?;
    let file_name = path.file_name().map(ToOwned::to_owned);

    let mut watcher = PollWatcher::new(
        move |res: notify::Result<NotifyEvent>| match res {
            Ok(event) => {
                let relevant = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == file_name.as_deref());
                if relevant {
                    // A full buffer already guarantees a pending flush.
                    let _ = tx.try_send(());
                }
            }
            Err(err) => debug!(err = %err, "status watch error"),
        },
        notify::Config::default().with_poll_interval(poll_interval),
    )?;
    watcher.watch(parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

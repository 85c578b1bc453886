//! Cooperative stop requests from the keyboard and from a sentinel file.
//!
//! Both producers write the same [`StopState`]. The scheduler only reads it
//! at iteration boundaries, so a stop never cuts an agent invocation short.

use std::fs;
use std::io::{ErrorKind, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use notify::{Event as NotifyEvent, PollWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::core::types::{StopSource, StopState};

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_FILE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Create the sentinel file with a timestamp line.
pub fn request_stop_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", Utc::now().to_rfc3339()))
        .with_context(|| format!("write stop file {}", path.display()))
}

/// Cheap, clonable view of the shared stop state.
#[derive(Debug, Clone)]
pub struct StopHandle {
    state: Arc<Mutex<StopState>>,
    stop_path: PathBuf,
}

impl StopHandle {
    pub fn state(&self) -> StopState {
        *lock(&self.state)
    }

    /// Boundary check. Re-syncs with the sentinel file before answering.
    pub fn is_stop_requested(&self) -> bool {
        sync_with_file(&self.state, &self.stop_path).requested
    }

    pub fn toggle(&self) -> StopState {
        toggle_state(&self.state)
    }

    pub fn stop_path(&self) -> &Path {
        &self.stop_path
    }
}

/// Owns the key listener and the sentinel-file subscription for one session.
pub struct StopSignal {
    handle: StopHandle,
    stop_key: char,
    keyboard: bool,
    poll_interval: Duration,
    key_listener: Option<KeyListener>,
    file_watcher: Option<PollWatcher>,
}

impl StopSignal {
    pub fn new(stop_path: impl Into<PathBuf>, stop_key: char) -> Self {
        Self {
            handle: StopHandle {
                state: Arc::new(Mutex::new(StopState::default())),
                stop_path: stop_path.into(),
            },
            stop_key,
            keyboard: true,
            poll_interval: DEFAULT_FILE_POLL_INTERVAL,
            key_listener: None,
            file_watcher: None,
        }
    }

    /// Never install the raw-mode key listener, even on a terminal.
    pub fn without_keyboard(mut self) -> Self {
        self.keyboard = false;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Pick up a pre-existing sentinel file and start both listeners.
    pub fn init(&mut self) -> StopState {
        let state = sync_with_file(&self.handle.state, &self.handle.stop_path);
        if state.source == StopSource::File {
            info!(path = %self.handle.stop_path.display(), "stop file present before start");
        }

        if self.file_watcher.is_none() {
            match watch_stop_file(&self.handle, self.poll_interval) {
                Ok(watcher) => self.file_watcher = Some(watcher),
                Err(err) => debug!(
                    err = %err,
                    "stop file watch unavailable, checking at boundaries only"
                ),
            }
        }

        if self.keyboard && self.key_listener.is_none() && std::io::stdin().is_terminal() {
            match KeyListener::spawn(self.handle.state.clone(), self.stop_key) {
                Ok(listener) => {
                    info!(
                        key = %self.stop_key,
                        "press the stop key to finish after the current iteration"
                    );
                    self.key_listener = Some(listener);
                }
                Err(err) => warn!(err = %err, "keyboard stop unavailable"),
            }
        }
        self.state()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.handle.is_stop_requested()
    }

    pub fn toggle(&self) -> StopState {
        self.handle.toggle()
    }

    pub fn state(&self) -> StopState {
        self.handle.state()
    }

    /// Restore the terminal, drop the file subscription, optionally remove the sentinel.
    pub fn cleanup(&mut self, delete_file: bool) {
        if let Some(listener) = self.key_listener.take() {
            listener.stop();
        }
        self.file_watcher = None;
        if delete_file {
            match fs::remove_file(&self.handle.stop_path) {
                Ok(()) => debug!(path = %self.handle.stop_path.display(), "removed stop file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    path = %self.handle.stop_path.display(),
                    err = %err,
                    "failed to remove stop file"
                ),
            }
        }
    }
}

fn lock(state: &Mutex<StopState>) -> MutexGuard<'_, StopState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyboard semantics: request, or cancel a keyboard request. File stops stay.
fn toggle_state(state: &Mutex<StopState>) -> StopState {
    let mut guard = lock(state);
    match (guard.requested, guard.source) {
        (true, StopSource::File) => {
            info!("stop was requested by file; delete the file to cancel");
        }
        (true, _) => {
            *guard = StopState::default();
            info!("stop cancelled");
        }
        (false, _) => {
            *guard = StopState::requested_by(StopSource::Keyboard);
            info!("stop requested, finishing current iteration");
        }
    }
    *guard
}

/// File semantics: presence requests a stop, removal cancels a file stop.
fn sync_with_file(state: &Mutex<StopState>, path: &Path) -> StopState {
    let present = path.exists();
    let mut guard = lock(state);
    if present && guard.source != StopSource::File {
        *guard = StopState::requested_by(StopSource::File);
        info!(path = %path.display(), "stop file detected");
    } else if !present && guard.source == StopSource::File {
        *guard = StopState::default();
        info!(path = %path.display(), "stop file removed, stop cancelled");
    }
    *guard
}

fn watch_stop_file(handle: &StopHandle, poll_interval: Duration) -> notify::Result<PollWatcher> {
    let parent = handle
        .stop_path
        .parent()
        .filter(|parent| parent.is_dir())
        .ok_or_else(|| notify::Error::generic("stop file directory does not exist"))?
        .to_path_buf();
    let file_name = handle.stop_path.file_name().map(ToOwned::to_owned);
    let state = handle.state.clone();
    let stop_path = handle.stop_path.clone();

    let mut watcher = PollWatcher::new(
        move |res: notify::Result<NotifyEvent>| {
            let Ok(event) = res else {
                return;
            };
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref())
            {
                sync_with_file(&state, &stop_path);
            }
        },
        notify::Config::default().with_poll_interval(poll_interval),
    )?;
    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Raw-mode key reader on a dedicated thread.
struct KeyListener {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl KeyListener {
    fn spawn(state: Arc<Mutex<StopState>>, stop_key: char) -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let spawned = thread::Builder::new()
            .name("looper-stop-key".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    match event::poll(KEY_POLL_INTERVAL) {
                        Ok(true) => match event::read() {
                            Ok(Event::Key(key)) => handle_key(&state, stop_key, key),
                            Ok(_) => {}
                            Err(err) => {
                                warn!(err = %err, "keyboard read failed, listener stopped");
                                break;
                            }
                        },
                        Ok(false) => {}
                        Err(err) => {
                            warn!(err = %err, "keyboard poll failed, listener stopped");
                            break;
                        }
                    }
                }
            });
        match spawned {
            Ok(thread) => Ok(Self {
                shutdown,
                thread: Some(thread),
            }),
            Err(err) => {
                restore_terminal();
                Err(err)
            }
        }
    }

    fn stop(mut self) {
        self.shutdown_now();
    }

    fn shutdown_now(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("keyboard listener panicked");
            }
            restore_terminal();
        }
    }
}

impl Drop for KeyListener {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn restore_terminal() {
    if let Err(err) = terminal::disable_raw_mode() {
        warn!(err = %err, "failed to restore terminal mode");
    }
}

fn handle_key(state: &Mutex<StopState>, stop_key: char, key: KeyEvent) {
    if key.kind != KeyEventKind::Press {
        return;
    }
    match key.code {
        // Raw mode turns Ctrl-C into a key event; hand it back to the signal path.
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => raise_interrupt(),
        KeyCode::Char(c)
            if c.eq_ignore_ascii_case(&stop_key)
                && !key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
        {
            toggle_state(state);
        }
        _ => {}
    }
}

#[cfg(unix)]
fn raise_interrupt() {
    if let Err(err) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT) {
        warn!(err = %err, "failed to re-raise interrupt");
    }
}

#[cfg(not(unix))]
fn raise_interrupt() {
    warn!("interrupt key ignored in raw mode on this platform");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn signal(dir: &Path) -> StopSignal {
        StopSignal::new(dir.join("STOP"), 's')
            .without_keyboard()
            .with_poll_interval(Duration::from_millis(50))
    }

    fn press(c: char, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), modifiers)
    }

    #[test]
    fn pre_existing_file_requests_stop_on_init() {
        let temp = tempfile::tempdir().expect("tempdir");
        request_stop_file(&temp.path().join("STOP")).expect("stop file");
        let mut stop = signal(temp.path());
        let state = stop.init();
        assert_eq!(state, StopState::requested_by(StopSource::File));
        assert!(stop.is_stop_requested());
        stop.cleanup(false);
    }

    #[test]
    fn toggle_requests_and_cancels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut stop = signal(temp.path());
        assert_eq!(stop.init(), StopState::default());

        assert_eq!(stop.toggle(), StopState::requested_by(StopSource::Keyboard));
        assert!(stop.is_stop_requested());
        assert_eq!(stop.toggle(), StopState::default());
        assert!(!stop.is_stop_requested());
        stop.cleanup(true);
    }

    #[test]
    fn toggle_does_not_clear_file_stop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut stop = signal(temp.path());
        stop.init();
        request_stop_file(&temp.path().join("STOP")).expect("stop file");
        assert!(stop.is_stop_requested());

        assert_eq!(stop.toggle(), StopState::requested_by(StopSource::File));
        assert!(stop.is_stop_requested());
        stop.cleanup(true);
    }

    #[test]
    fn removing_file_cancels_file_stop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("STOP");
        request_stop_file(&path).expect("stop file");
        let mut stop = signal(temp.path());
        stop.init();
        fs::remove_file(&path).expect("remove");
        assert!(!stop.is_stop_requested());
        assert_eq!(stop.state().source, StopSource::None);
    }

    #[test]
    fn file_created_after_init_is_picked_up_by_watcher() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut stop = signal(temp.path());
        let handle = stop.handle();
        stop.init();
        request_stop_file(handle.stop_path()).expect("stop file");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.state().requested && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(handle.state(), StopState::requested_by(StopSource::File));
        stop.cleanup(true);
    }

    #[test]
    fn cleanup_removes_file_and_tolerates_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("STOP");
        request_stop_file(&path).expect("stop file");
        let mut stop = signal(temp.path());
        stop.init();

        stop.cleanup(true);
        assert!(!path.exists());
        stop.cleanup(true);

        let mut keep = signal(temp.path());
        request_stop_file(&path).expect("stop file");
        keep.init();
        keep.cleanup(false);
        assert!(path.exists());
    }

    #[test]
    fn only_the_stop_key_toggles() {
        let state = Mutex::new(StopState::default());
        handle_key(&state, 's', press('x', KeyModifiers::NONE));
        assert!(!lock(&state).requested);
        handle_key(&state, 's', press('s', KeyModifiers::ALT));
        assert!(!lock(&state).requested);
        handle_key(&state, 's', press('S', KeyModifiers::SHIFT));
        assert_eq!(*lock(&state), StopState::requested_by(StopSource::Keyboard));
        handle_key(&state, 's', press('s', KeyModifiers::NONE));
        assert_eq!(*lock(&state), StopState::default());
    }

    #[test]
    fn stop_file_contains_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("STOP");
        request_stop_file(&path).expect("stop file");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(chrono::DateTime::parse_from_rfc3339(contents.trim()).is_ok());
    }
}

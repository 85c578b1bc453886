//! I/O helpers for looper sessions.

pub mod agent;
pub mod config;
pub mod init;
pub mod iteration_log;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod session_state;
pub mod status_store;
pub mod stop;
pub mod watcher;

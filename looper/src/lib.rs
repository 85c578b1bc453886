//! Unattended agent loop.
//!
//! Invokes an external agent process over and over until it reports the task
//! complete, a budget runs out, or the operator stops it. The crate keeps the
//! same split throughout:
//!
//! - **[`core`]**: pure decisions (status shapes, change deltas, stagnation,
//!   boundary precedence, verification verdicts). No I/O.
//! - **[`io`]**: side effects (agent process, status file, watchers, stop
//!   signal, prompts, persisted state).
//!
//! [`scheduler`] and [`verify`] tie the two together into a session.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;

//! Tracing setup for the looper binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: progress and diagnostics via `RUST_LOG`, output
//!   to stderr. Agent output lines are logged under the `agent` target.
//!
//! - **Iteration logging (`io/iteration_log`)**: product artifacts in
//!   `.looper/iterations/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=looper=debug,agent=warn looper run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

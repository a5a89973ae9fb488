//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Supervisor events (`core/events`, `io/event_log`)**: The user-facing
//!   record of a run, appended to `<run>.events.jsonl`. Unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Reads `RUST_LOG`, defaulting to `warn`.
///
/// ```bash
/// RUST_LOG=shipgate=debug shipgate run apply runs/run-1.json request.json --write
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

//! Diagnostic tracing for the swarm CLI and mission loops.
//!
//! Tracing output goes to stderr (inside a worker's pane for mission loops)
//! and is filtered with `RUST_LOG`. It is separate from the product
//! artifacts under `.swarm/` (checkpoints, status heartbeats, failure and
//! session logs), which are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=swarm=debug swarm mission --slot 0 --kind researcher
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

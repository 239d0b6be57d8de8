//! Stable exit codes for swarm CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid layout/config/arguments, a fatal mission error, or any other failure.
pub const INVALID: i32 = 1;
/// The execution context was in the wrong state: already running on start,
/// missing on a per-worker command, or the worker slot was already running.
pub const CONTEXT: i32 = 2;

//! Supervised mission loops for a multi-worker research pipeline.
//!
//! Four workers (researcher, converter, backtester, optimizer) each run an
//! independent loop that invokes an external agent runtime, validates what the
//! session produced, classifies failures, and checkpoints after every attempt.
//! Work moves between stages through file-based queues.
//!
//! - **[`core`]**: Pure logic (budget gate, artifact validation, failure
//!   classification, recovery actions). No I/O.
//! - **[`io`]**: Side effects (layout, config, queues, checkpoints, status
//!   files, subprocesses, the tmux execution context).
//!
//! Orchestration modules ([`mission`], [`lifecycle`], [`status`], [`health`])
//! combine the two to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod mission;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

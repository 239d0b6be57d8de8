//! I/O helpers for swarm commands.

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod failure_log;
pub mod fs_util;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod queue;
pub mod runtime;
pub mod state_store;
pub mod status_file;

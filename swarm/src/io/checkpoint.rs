//! Per-slot checkpoint storage (`.swarm/checkpoints/slot-N.json`).

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fs_util::{read_json_opt, write_json_atomic};
use crate::core::types::{CheckpointStatus, WorkerKind};

/// Resume point for one slot.
///
/// `session_number` counts attempts whose checkpoint write completed, so an
/// attempt that dies before its write is re-run under the same number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub slot_id: u32,
    pub kind: WorkerKind,
    pub session_number: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub files_created_total: u64,
    pub tokens_in_total: u64,
    pub tokens_out_total: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Current (possibly extended) session timeout.
    pub timeout_secs: u64,
    pub status: CheckpointStatus,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    /// Starting point for a slot that has never run.
    pub fn fresh(kind: WorkerKind, timeout_secs: u64) -> Self {
        Self {
            slot_id: kind.slot(),
            kind,
            session_number: 0,
            sessions_completed: 0,
            sessions_failed: 0,
            files_created_total: 0,
            tokens_in_total: 0,
            tokens_out_total: 0,
            consecutive_failures: 0,
            timeout_secs,
            status: CheckpointStatus::Running,
            timestamp: Utc::now(),
        }
    }

    /// The attempt number the next session runs under.
    pub fn next_session(&self) -> u64 {
        self.session_number + 1
    }
}

/// Load a checkpoint; a missing file yields `None`.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    let checkpoint: Option<Checkpoint> = read_json_opt(path)?;
    debug!(path = %path.display(), session = ?checkpoint.as_ref().map(|c| c.session_number), "checkpoint loaded");
    Ok(checkpoint)
}

/// Atomically write a checkpoint (temp file + rename).
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    debug!(path = %path.display(), session = checkpoint.session_number, status = ?checkpoint.status, "writing checkpoint");
    write_json_atomic(path, checkpoint)
}

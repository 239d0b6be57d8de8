//! Heartbeat status files (`.swarm/status/slot-N.json`).
//!
//! Written by the mission loop at every step and read by the lifecycle
//! manager and `swarm status`. Single writer, many readers.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fs_util::{read_json_opt, write_json_atomic};
use crate::core::types::{Mode, WorkerKind, WorkerState};

/// Where in the iteration a slot currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStep {
    Starting,
    Budget,
    Prompt,
    Invoke,
    Validate,
    Classify,
    Checkpoint,
    Cooldown,
    Backoff,
    Stopped,
}

impl MissionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MissionStep::Starting => "starting",
            MissionStep::Budget => "budget",
            MissionStep::Prompt => "prompt",
            MissionStep::Invoke => "invoke",
            MissionStep::Validate => "validate",
            MissionStep::Classify => "classify",
            MissionStep::Checkpoint => "checkpoint",
            MissionStep::Cooldown => "cooldown",
            MissionStep::Backoff => "backoff",
            MissionStep::Stopped => "stopped",
        }
    }
}

impl fmt::Display for MissionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotStatus {
    pub slot_id: u32,
    pub kind: WorkerKind,
    pub mode: Mode,
    pub state: WorkerState,
    pub current_step: MissionStep,
    /// Session currently running (or last run).
    pub session_number: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub files_created_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

pub fn read_status(path: &Path) -> Result<Option<SlotStatus>> {
    read_json_opt(path)
}

pub fn write_status(path: &Path, status: &SlotStatus) -> Result<()> {
    write_json_atomic(path, status)
}

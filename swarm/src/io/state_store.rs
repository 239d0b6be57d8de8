//! Persistent mission state behind one seam.
//!
//! The mission loop and lifecycle manager only talk to [`StateStore`]. The
//! file-backed store is what runs in production; the in-memory store lets
//! tests inspect every write and simulate crashes between steps.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::{Checkpoint, load_checkpoint, write_checkpoint};
use super::failure_log::{FailureRecord, append_failure, read_failures};
use super::fs_util::{append_json_line, read_json_lines};
use super::paths::SwarmPaths;
use super::status_file::{SlotStatus, read_status, write_status};
use crate::core::types::{FailureKind, SessionOutcome};

/// One mission attempt. Appended once, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub slot_id: u32,
    pub session_number: u64,
    pub started_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub outcome: SessionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    pub files_created: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

pub trait StateStore {
    fn load_checkpoint(&self, slot: u32) -> Result<Option<Checkpoint>>;
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn read_status(&self, slot: u32) -> Result<Option<SlotStatus>>;
    fn write_status(&self, status: &SlotStatus) -> Result<()>;
    fn append_failure(&self, record: &FailureRecord) -> Result<()>;
    fn append_session(&self, record: &SessionRecord) -> Result<()>;
    fn failures(&self) -> Result<Vec<FailureRecord>>;
    fn sessions(&self, slot: u32) -> Result<Vec<SessionRecord>>;
}

/// Store backed by the `.swarm/` layout.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    paths: SwarmPaths,
}

impl FileStateStore {
    pub fn new(paths: SwarmPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &SwarmPaths {
        &self.paths
    }
}

impl StateStore for FileStateStore {
    fn load_checkpoint(&self, slot: u32) -> Result<Option<Checkpoint>> {
        load_checkpoint(&self.paths.checkpoint_path(slot))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_checkpoint(&self.paths.checkpoint_path(checkpoint.slot_id), checkpoint)
    }

    fn read_status(&self, slot: u32) -> Result<Option<SlotStatus>> {
        read_status(&self.paths.status_path(slot))
    }

    fn write_status(&self, status: &SlotStatus) -> Result<()> {
        write_status(&self.paths.status_path(status.slot_id), status)
    }

    fn append_failure(&self, record: &FailureRecord) -> Result<()> {
        append_failure(&self.paths.failure_log_path, record)
    }

    fn append_session(&self, record: &SessionRecord) -> Result<()> {
        append_json_line(&self.paths.session_log_path(record.slot_id), record)
    }

    fn failures(&self) -> Result<Vec<FailureRecord>> {
        read_failures(&self.paths.failure_log_path)
    }

    fn sessions(&self, slot: u32) -> Result<Vec<SessionRecord>> {
        read_json_lines(&self.paths.session_log_path(slot))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    checkpoints: BTreeMap<u32, Checkpoint>,
    checkpoint_writes: Vec<Checkpoint>,
    statuses: BTreeMap<u32, SlotStatus>,
    status_writes: Vec<SlotStatus>,
    failures: Vec<FailureRecord>,
    sessions: Vec<SessionRecord>,
    fail_checkpoint_writes: bool,
}

/// In-memory store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory state store poisoned"))
    }

    /// Make every later checkpoint write fail, as a crash before the write would.
    pub fn fail_checkpoint_writes(&self, fail: bool) -> Result<()> {
        self.lock()?.fail_checkpoint_writes = fail;
        Ok(())
    }

    pub fn checkpoint_writes(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.lock()?.checkpoint_writes.clone())
    }

    pub fn status_writes(&self) -> Result<Vec<SlotStatus>> {
        Ok(self.lock()?.status_writes.clone())
    }
}

impl StateStore for MemoryStateStore {
    fn load_checkpoint(&self, slot: u32) -> Result<Option<Checkpoint>> {
        Ok(self.lock()?.checkpoints.get(&slot).cloned())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_checkpoint_writes {
            return Err(anyhow!("checkpoint write failed (simulated)"));
        }
        state
            .checkpoints
            .insert(checkpoint.slot_id, checkpoint.clone());
        state.checkpoint_writes.push(checkpoint.clone());
        Ok(())
    }

    fn read_status(&self, slot: u32) -> Result<Option<SlotStatus>> {
        Ok(self.lock()?.statuses.get(&slot).cloned())
    }

    fn write_status(&self, status: &SlotStatus) -> Result<()> {
        let mut state = self.lock()?;
        state.statuses.insert(status.slot_id, status.clone());
        state.status_writes.push(status.clone());
        Ok(())
    }

    fn append_failure(&self, record: &FailureRecord) -> Result<()> {
        self.lock()?.failures.push(record.clone());
        Ok(())
    }

    fn append_session(&self, record: &SessionRecord) -> Result<()> {
        self.lock()?.sessions.push(record.clone());
        Ok(())
    }

    fn failures(&self) -> Result<Vec<FailureRecord>> {
        Ok(self.lock()?.failures.clone())
    }

    fn sessions(&self, slot: u32) -> Result<Vec<SessionRecord>> {
        Ok(self
            .lock()?
            .sessions
            .iter()
            .filter(|record| record.slot_id == slot)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::WorkerKind;

    fn session(slot_id: u32, session_number: u64) -> SessionRecord {
        SessionRecord {
            slot_id,
            session_number,
            started_at: Utc::now(),
            timeout_secs: 60,
            outcome: SessionOutcome::Failed,
            failure_kind: Some(FailureKind::NoOutput),
            files_created: 0,
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: 10,
            exit_code: Some(0),
        }
    }

    /// Exercises the file store through the trait, the way the loop uses it.
    #[test]
    fn file_store_persists_through_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SwarmPaths::new(temp.path());
        let store = FileStateStore::new(paths.clone());

        let checkpoint = Checkpoint::fresh(WorkerKind::Converter, 60);
        store.save_checkpoint(&checkpoint).expect("save");
        assert!(paths.checkpoint_path(1).is_file());
        assert_eq!(store.load_checkpoint(1).expect("load"), Some(checkpoint));
        assert_eq!(store.load_checkpoint(0).expect("load"), None);

        store.append_session(&session(1, 1)).expect("append");
        store.append_session(&session(1, 2)).expect("append");
        store.append_session(&session(3, 1)).expect("append");
        assert_eq!(store.sessions(1).expect("sessions").len(), 2);
        assert_eq!(store.sessions(3).expect("sessions").len(), 1);
    }

    #[test]
    fn memory_store_can_simulate_failed_checkpoint_writes() {
        let store = MemoryStateStore::new();
        let checkpoint = Checkpoint::fresh(WorkerKind::Researcher, 60);
        store.save_checkpoint(&checkpoint).expect("save");
        store.fail_checkpoint_writes(true).expect("toggle");
        let mut next = checkpoint.clone();
        next.session_number = 1;
        assert!(store.save_checkpoint(&next).is_err());
        assert_eq!(
            store.load_checkpoint(0).expect("load").map(|c| c.session_number),
            Some(0)
        );
        assert_eq!(store.checkpoint_writes().expect("writes").len(), 1);
    }
}

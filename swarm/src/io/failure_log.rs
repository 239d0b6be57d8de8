//! Append-only failure log (`.swarm/failures.jsonl`).

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fs_util::{append_json_line, read_json_lines};
use crate::core::classifier::Classification;
use crate::core::recovery::RecoveryAction;
use crate::core::types::{FailureKind, WorkerKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureRecord {
    pub slot_id: u32,
    pub kind: WorkerKind,
    pub session_number: u64,
    pub failure_kind: FailureKind,
    pub action: RecoveryAction,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn from_classification(
        kind: WorkerKind,
        session_number: u64,
        classification: &Classification,
    ) -> Self {
        Self {
            slot_id: kind.slot(),
            kind,
            session_number,
            failure_kind: classification.kind,
            action: classification.action,
            detail: classification.detail.clone(),
            timestamp: Utc::now(),
        }
    }
}

pub fn append_failure(path: &Path, record: &FailureRecord) -> Result<()> {
    append_json_line(path, record)
}

/// All readable records; torn or malformed lines are skipped.
pub fn read_failures(path: &Path) -> Result<Vec<FailureRecord>> {
    read_json_lines(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("failures.jsonl");
        for session in 1..=3 {
            let classification = Classification {
                kind: FailureKind::RateLimit,
                action: RecoveryAction::rate_limit_backoff(),
                detail: format!("matched '429' in session {session}"),
            };
            append_failure(
                &path,
                &FailureRecord::from_classification(WorkerKind::Researcher, session, &classification),
            )
            .expect("append");
        }
        let records = read_failures(&path).expect("read");
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].session_number, 3);
        let raw = std::fs::read_to_string(&path).expect("raw");
        assert!(raw.contains("\"failure_kind\":\"rate_limit\""));
        assert!(raw.contains("\"action\":{\"action\":\"backoff\""));
    }
}

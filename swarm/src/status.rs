//! Status aggregation for `swarm status`.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::cancel::{CancelToken, Sleeper};
use crate::core::types::{Mode, QueueName};
use crate::io::checkpoint::Checkpoint;
use crate::io::context::ContextProvider;
use crate::io::failure_log::FailureRecord;
use crate::io::queue::QueueStore;
use crate::io::state_store::StateStore;
use crate::io::status_file::MissionStep;
use crate::lifecycle::{LifecycleManager, WorkerSlot};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRow {
    #[serde(flatten)]
    pub slot: WorkerSlot,
    pub mode: Option<Mode>,
    pub step: Option<MissionStep>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueRow {
    pub queue: QueueName,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub context: String,
    pub context_running: bool,
    pub workers: Vec<WorkerRow>,
    pub queues: Vec<QueueRow>,
    pub recent_failures: Vec<FailureRecord>,
}

/// Read every status source once.
pub fn collect_snapshot<P, S>(
    manager: &LifecycleManager<P>,
    store: &S,
    queues: &QueueStore,
    recent_failures: usize,
) -> Result<StatusSnapshot>
where
    P: ContextProvider,
    S: StateStore,
{
    manager.sync_heartbeats(store)?;
    let mut workers = Vec::new();
    for slot in manager.worker_states()? {
        let status = store.read_status(slot.slot_id)?;
        workers.push(WorkerRow {
            mode: status.as_ref().map(|s| s.mode),
            step: status.as_ref().map(|s| s.current_step),
            heartbeat_at: status.as_ref().map(|s| s.timestamp),
            checkpoint: store.load_checkpoint(slot.slot_id)?,
            slot,
        });
    }
    let queues = queues
        .pipeline_depths()?
        .into_iter()
        .map(|(queue, depth)| QueueRow { queue, depth })
        .collect();
    let failures = store.failures()?;
    let skip = failures.len().saturating_sub(recent_failures);

    Ok(StatusSnapshot {
        taken_at: Utc::now(),
        context: manager.provider().name().to_string(),
        context_running: manager.provider().context_exists()?,
        workers,
        queues,
        recent_failures: failures.into_iter().skip(skip).collect(),
    })
}

/// Collect a snapshot every `interval` until cancelled or `on_snapshot`
/// returns `false`. Returns how many snapshots were delivered.
pub fn poll_snapshots<Z, C, F>(
    interval: Duration,
    sleeper: &Z,
    cancel: &CancelToken,
    mut collect: C,
    mut on_snapshot: F,
) -> Result<u64>
where
    Z: Sleeper,
    C: FnMut() -> Result<StatusSnapshot>,
    F: FnMut(&StatusSnapshot) -> bool,
{
    let mut delivered = 0u64;
    while !cancel.is_cancelled() {
        let snapshot = collect()?;
        delivered += 1;
        if !on_snapshot(&snapshot) || !sleeper.pause(interval, cancel) {
            break;
        }
    }
    Ok(delivered)
}

/// Plain-text table for terminals.
pub fn render_snapshot(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let state = if snapshot.context_running {
        "running"
    } else {
        "not running"
    };
    let _ = writeln!(out, "context {}: {state}", snapshot.context);
    let _ = writeln!(
        out,
        "{:<4} {:<11} {:<9} {:<10} {:>8} {:>6} {:>6}  {}",
        "SLOT", "WORKER", "STATE", "STEP", "SESSION", "OK", "FAIL", "DETAIL"
    );
    for row in &snapshot.workers {
        let (session, ok, failed) = row.checkpoint.as_ref().map_or((0, 0, 0), |c| {
            (c.session_number, c.sessions_completed, c.sessions_failed)
        });
        let detail = row
            .slot
            .last_error
            .as_deref()
            .or(row.slot.current_task.as_deref())
            .unwrap_or("-");
        let _ = writeln!(
            out,
            "{:<4} {:<11} {:<9} {:<10} {:>8} {:>6} {:>6}  {detail}",
            row.slot.slot_id,
            row.slot.kind.as_str(),
            row.slot.state.as_str(),
            row.step.map_or("-", MissionStep::as_str),
            session,
            ok,
            failed,
        );
    }
    let depths: Vec<String> = snapshot
        .queues
        .iter()
        .map(|row| format!("{}={}", row.queue, row.depth))
        .collect();
    let _ = writeln!(out, "queues: {}", depths.join(" "));
    for failure in &snapshot.recent_failures {
        let _ = writeln!(
            out,
            "failure slot {} session {}: {} ({}) {}",
            failure.slot_id,
            failure.session_number,
            failure.failure_kind,
            failure.action.label(),
            failure.detail
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::Classification;
    use crate::core::recovery::RecoveryAction;
    use crate::core::types::{FailureKind, WorkerKind};
    use crate::io::queue::QueueEntry;
    use crate::lifecycle::LifecycleSettings;
    use crate::io::state_store::MemoryStateStore;
    use crate::test_support::{FakeProvider, RecordingSleeper};

    fn manager() -> LifecycleManager<FakeProvider> {
        LifecycleManager::new(
            FakeProvider::new(),
            LifecycleSettings {
                program: "swarm".to_string(),
                stop_grace: Duration::from_millis(10),
                poll_interval: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn snapshot_combines_checkpoints_queues_and_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queues = QueueStore::new(temp.path());
        queues
            .enqueue_atomic(
                QueueName::ToConvert,
                &QueueEntry::new(
                    QueueName::ToConvert,
                    "orb-7",
                    "researcher",
                    Default::default(),
                    serde_json::json!({"idea": "opening range"}),
                ),
            )
            .expect("enqueue");
        let store = MemoryStateStore::new();
        let mut checkpoint = Checkpoint::fresh(WorkerKind::Converter, 1800);
        checkpoint.session_number = 3;
        store.save_checkpoint(&checkpoint).expect("checkpoint");
        for session in 1..=3 {
            store
                .append_failure(&FailureRecord::from_classification(
                    WorkerKind::Converter,
                    session,
                    &Classification {
                        kind: FailureKind::DependencyError,
                        action: RecoveryAction::Continue,
                        detail: "No module named talib".to_string(),
                    },
                ))
                .expect("failure");
        }

        let snapshot = collect_snapshot(&manager(), &store, &queues, 2).expect("snapshot");

        assert!(!snapshot.context_running);
        assert_eq!(snapshot.workers.len(), 4);
        assert_eq!(
            snapshot.workers[1].checkpoint.as_ref().map(|c| c.session_number),
            Some(3)
        );
        assert_eq!(snapshot.queues[1].depth, 1);
        assert_eq!(snapshot.recent_failures.len(), 2);
        assert_eq!(snapshot.recent_failures[0].session_number, 2);

        let text = render_snapshot(&snapshot);
        assert!(text.contains("context fake: not running"));
        assert!(text.contains("to-convert=1"));

        let json = serde_json::to_value(&snapshot).expect("json");
        assert_eq!(json["workers"][1]["kind"], "converter");
        assert_eq!(json["workers"][1]["state"], "stopped");
    }

    #[test]
    fn polling_stops_when_callback_declines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let queues = QueueStore::new(temp.path());
        let store = MemoryStateStore::new();
        let manager = manager();
        let sleeper = RecordingSleeper::default();
        let mut seen = 0;

        let delivered = poll_snapshots(
            Duration::from_secs(2),
            &sleeper,
            &CancelToken::new(),
            || collect_snapshot(&manager, &store, &queues, 5),
            |_| {
                seen += 1;
                seen < 3
            },
        )
        .expect("poll");

        assert_eq!(delivered, 3);
        assert_eq!(sleeper.pauses(), vec![Duration::from_secs(2); 2]);
    }
}

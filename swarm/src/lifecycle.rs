//! Worker lifecycle manager: host the four mission loops in one execution
//! context and start/stop them as a group or one at a time.
//!
//! The slot table lives behind one `Mutex` shared (via `Arc`) with the grace
//! threads spawned by [`LifecycleManager::stop_worker`]. Loops report back
//! through their status files; [`LifecycleManager::sync_heartbeats`] folds
//! those into the table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Mode, WorkerKind, WorkerState};
use crate::io::context::{ContextExistsError, ContextMissingError, ContextProvider, shell_quote};
use crate::io::state_store::StateStore;

/// Number of slots in the grid; one per [`WorkerKind`].
pub const SLOT_COUNT: u32 = WorkerKind::ALL.len() as u32;

/// `start_worker` found the slot already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAlreadyRunningError {
    pub kind: WorkerKind,
}

impl fmt::Display for WorkerAlreadyRunningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} (slot {}) is already running",
            self.kind,
            self.kind.slot()
        )
    }
}

impl std::error::Error for WorkerAlreadyRunningError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSlot {
    pub slot_id: u32,
    pub kind: WorkerKind,
    pub state: WorkerState,
    /// Provider-specific slot reference, e.g. a tmux pane target.
    pub context_ref: Option<String>,
    pub sessions_run: u64,
    pub tasks_completed: u64,
    pub current_task: Option<String>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkerSlot {
    pub fn stopped(kind: WorkerKind) -> Self {
        Self {
            slot_id: kind.slot(),
            kind,
            state: WorkerState::Stopped,
            context_ref: None,
            sessions_run: 0,
            tasks_completed: 0,
            current_task: None,
            last_error: None,
            started_at: None,
        }
    }

    /// Starting, Running, or Idle.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Starting | WorkerState::Running | WorkerState::Idle
        )
    }

    fn reset(&mut self) {
        *self = Self::stopped(self.kind);
    }
}

/// Final state of a single-worker stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStop {
    pub slot: WorkerSlot,
    /// The loop's own heartbeat reported the stop before the grace period
    /// ended.
    pub confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Shell-ready path of the `swarm` binary typed into each slot.
    pub program: String,
    pub stop_grace: Duration,
    pub poll_interval: Duration,
}

impl LifecycleSettings {
    /// Launch loops with the currently running executable.
    pub fn for_current_exe(stop_grace: Duration) -> Result<Self> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        Ok(Self {
            program: shell_quote(&exe.to_string_lossy()),
            stop_grace,
            poll_interval: Duration::from_millis(250),
        })
    }
}

type SlotTable = Arc<Mutex<BTreeMap<u32, WorkerSlot>>>;

pub struct LifecycleManager<P> {
    provider: P,
    settings: LifecycleSettings,
    slots: SlotTable,
}

impl<P: ContextProvider> LifecycleManager<P> {
    pub fn new(provider: P, settings: LifecycleSettings) -> Self {
        let slots = WorkerKind::ALL
            .iter()
            .map(|kind| (kind.slot(), WorkerSlot::stopped(*kind)))
            .collect();
        Self {
            provider,
            settings,
            slots: Arc::new(Mutex::new(slots)),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Command typed into a slot to run its loop. `exec` replaces the
    /// slot's shell, so the slot closes when the loop exits.
    pub fn launch_command(&self, kind: WorkerKind, mode: Mode) -> String {
        format!(
            "exec {} mission --slot {} --kind {kind} --mode {mode}",
            self.settings.program,
            kind.slot()
        )
    }

    /// Create the context, lay out one slot per worker, and launch every loop.
    ///
    /// An existing context is never touched: the call fails with
    /// [`ContextExistsError`]. Any later failure destroys the half-built
    /// context and marks the slots Error.
    #[instrument(skip_all, fields(context = %self.provider.name(), mode = %mode))]
    pub fn start_all(&self, mode: Mode) -> Result<()> {
        if self.provider.context_exists()? {
            return Err(ContextExistsError {
                name: self.provider.name().to_string(),
            }
            .into());
        }
        self.update_all(|slot| {
            slot.reset();
            slot.state = WorkerState::Starting;
        })?;

        let launched = self.provider.create_context().and_then(|()| {
            self.provider.create_grid(SLOT_COUNT)?;
            for kind in WorkerKind::ALL {
                self.launch(kind, mode)?;
            }
            Ok(())
        });
        if let Err(err) = launched {
            warn!(err = %err, "start failed; tearing down context");
            if let Err(destroy_err) = self.provider.destroy_context() {
                warn!(err = %destroy_err, "failed to destroy partial context");
            }
            let message = format!("{err:#}");
            self.update_all(|slot| {
                slot.state = WorkerState::Error;
                slot.last_error = Some(message.clone());
            })?;
            return Err(err);
        }
        info!("all workers launched");
        Ok(())
    }

    /// Launch one worker into its slot of an existing context.
    #[instrument(skip_all, fields(kind = %kind, mode = %mode))]
    pub fn start_worker(&self, kind: WorkerKind, mode: Mode) -> Result<()> {
        if !self.provider.context_exists()? {
            return Err(self.missing_context());
        }
        {
            let mut slots = self.lock()?;
            let slot = slot_mut(&mut slots, kind)?;
            if slot.is_active() {
                return Err(WorkerAlreadyRunningError { kind }.into());
            }
            slot.reset();
            slot.state = WorkerState::Starting;
        }
        if let Err(err) = self.launch(kind, mode) {
            let message = format!("{err:#}");
            self.update(kind, |slot| {
                slot.state = WorkerState::Error;
                slot.last_error = Some(message);
            })?;
            return Err(err);
        }
        Ok(())
    }

    fn launch(&self, kind: WorkerKind, mode: Mode) -> Result<()> {
        let command = self.launch_command(kind, mode);
        debug!(kind = %kind, command = %command, "launching worker");
        self.provider.send_input(kind.slot(), &command)?;
        let context_ref = self.provider.slot_ref(kind.slot());
        self.update(kind, |slot| {
            slot.state = WorkerState::Running;
            slot.context_ref = Some(context_ref);
            slot.started_at = Some(Utc::now());
            slot.last_error = None;
        })
    }

    /// Interrupt every loop and take the context down.
    ///
    /// Without a context this is a no-op that still leaves every slot
    /// Stopped. Slots end Stopped even when the forced destroy fails; that
    /// error is returned.
    #[instrument(skip_all, fields(context = %self.provider.name()))]
    pub fn stop_all(&self) -> Result<()> {
        if !self.provider.context_exists()? {
            debug!("no context; nothing to stop");
            return self.update_all(WorkerSlot::reset);
        }
        self.update_all(|slot| slot.state = WorkerState::Stopping)?;
        for kind in WorkerKind::ALL {
            if let Err(err) = self.provider.interrupt(kind.slot()) {
                warn!(kind = %kind, err = %err, "failed to interrupt worker");
            }
        }

        let deadline = Instant::now() + self.settings.stop_grace;
        let mut exited = false;
        while Instant::now() < deadline {
            if !self.provider.context_exists().unwrap_or(true) {
                exited = true;
                break;
            }
            thread::sleep(self.settings.poll_interval);
        }
        let destroyed = if exited {
            info!("workers exited within grace period");
            Ok(())
        } else {
            warn!(
                grace_secs = self.settings.stop_grace.as_secs(),
                "grace period elapsed; destroying context"
            );
            self.provider.destroy_context()
        };

        self.update_all(WorkerSlot::reset)?;
        destroyed
    }

    /// Interrupt one worker. A grace thread marks it Stopped if no
    /// heartbeat has moved it on by the time the grace period ends.
    #[instrument(skip_all, fields(kind = %kind))]
    pub fn stop_worker(&self, kind: WorkerKind) -> Result<JoinHandle<()>> {
        {
            let mut slots = self.lock()?;
            let slot = slot_mut(&mut slots, kind)?;
            if !slot.is_active() {
                return Err(anyhow!("worker {kind} is not running"));
            }
            slot.state = WorkerState::Stopping;
        }
        if !self.provider.context_exists()? {
            self.update(kind, WorkerSlot::reset)?;
            return Err(self.missing_context());
        }
        self.provider.interrupt(kind.slot())?;

        let slots = Arc::clone(&self.slots);
        let grace = self.settings.stop_grace;
        Ok(thread::spawn(move || {
            thread::sleep(grace);
            match slots.lock() {
                Ok(mut slots) => {
                    if let Some(slot) = slots.get_mut(&kind.slot())
                        && slot.state == WorkerState::Stopping
                    {
                        debug!(kind = %kind, "grace period over; marking stopped");
                        slot.reset();
                    }
                }
                Err(_) => warn!(kind = %kind, "slot table poisoned"),
            }
        }))
    }

    /// Wait for a worker interrupted by [`Self::stop_worker`] to settle.
    ///
    /// Polls the loop's heartbeat until it reports a stop, or until the grace
    /// thread finishes and force-marks the slot Stopped.
    pub fn await_worker_stop<S: StateStore>(
        &self,
        kind: WorkerKind,
        store: &S,
        grace: JoinHandle<()>,
    ) -> Result<WorkerStop> {
        loop {
            self.sync_heartbeats(store)?;
            let slot = self.slot(kind)?;
            let reported = store.read_status(kind.slot())?.is_some_and(|status| {
                matches!(status.state, WorkerState::Stopped | WorkerState::Error)
            });
            if reported && slot.state != WorkerState::Stopping {
                debug!(kind = %kind, state = %slot.state.as_str(), "worker confirmed stop");
                return Ok(WorkerStop {
                    slot,
                    confirmed: true,
                });
            }
            if slot.state != WorkerState::Stopping || grace.is_finished() {
                break;
            }
            thread::sleep(self.settings.poll_interval);
        }
        grace
            .join()
            .map_err(|_| anyhow!("grace thread for {kind} panicked"))?;
        warn!(kind = %kind, "no stop heartbeat within grace period; marked stopped");
        Ok(WorkerStop {
            slot: self.slot(kind)?,
            confirmed: false,
        })
    }

    fn slot(&self, kind: WorkerKind) -> Result<WorkerSlot> {
        let mut slots = self.lock()?;
        Ok(slot_mut(&mut slots, kind)?.clone())
    }

    /// Snapshot of every slot in slot order.
    pub fn worker_states(&self) -> Result<Vec<WorkerSlot>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.lock()?.values().any(WorkerSlot::is_active))
    }

    /// Fold each loop's status file into the slot table.
    ///
    /// Heartbeats that claim a live loop are ignored once the context is
    /// gone; those slots read Stopped.
    pub fn sync_heartbeats<S: StateStore>(&self, store: &S) -> Result<()> {
        let context_alive = self.provider.context_exists()?;
        let mut slots = self.lock()?;
        for kind in WorkerKind::ALL {
            let Some(status) = store.read_status(kind.slot())? else {
                continue;
            };
            let slot = slot_mut(&mut slots, kind)?;
            if slot.state == WorkerState::Stopping && status.state != WorkerState::Stopped {
                continue;
            }
            let live = matches!(
                status.state,
                WorkerState::Starting | WorkerState::Running | WorkerState::Idle
            );
            slot.state = if live && !context_alive {
                WorkerState::Stopped
            } else {
                status.state
            };
            if context_alive && slot.context_ref.is_none() {
                slot.context_ref = Some(self.provider.slot_ref(kind.slot()));
            }
            slot.sessions_run = status.sessions_completed + status.sessions_failed;
            slot.tasks_completed = status.sessions_completed;
            slot.current_task = Some(match &status.detail {
                Some(detail) => format!(
                    "session {} {}: {detail}",
                    status.session_number, status.current_step
                ),
                None => format!("session {} {}", status.session_number, status.current_step),
            });
            slot.last_error = status.last_error.clone();
        }
        Ok(())
    }

    fn missing_context(&self) -> anyhow::Error {
        ContextMissingError {
            name: self.provider.name().to_string(),
        }
        .into()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<u32, WorkerSlot>>> {
        self.slots
            .lock()
            .map_err(|_| anyhow!("worker slot table poisoned"))
    }

    fn update(&self, kind: WorkerKind, apply: impl FnOnce(&mut WorkerSlot)) -> Result<()> {
        let mut slots = self.lock()?;
        apply(slot_mut(&mut slots, kind)?);
        Ok(())
    }

    fn update_all(&self, mut apply: impl FnMut(&mut WorkerSlot)) -> Result<()> {
        let mut slots = self.lock()?;
        slots.values_mut().for_each(&mut apply);
        Ok(())
    }
}

fn slot_mut(slots: &mut BTreeMap<u32, WorkerSlot>, kind: WorkerKind) -> Result<&mut WorkerSlot> {
    slots
        .get_mut(&kind.slot())
        .ok_or_else(|| anyhow!("worker {kind} is not tracked"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state_store::MemoryStateStore;
    use crate::io::status_file::{MissionStep, SlotStatus};
    use crate::test_support::{FakeProvider, FakeProviderState};

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            program: "/opt/bin/swarm".to_string(),
            stop_grace: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn states(manager: &LifecycleManager<FakeProvider>) -> Vec<WorkerState> {
        manager
            .worker_states()
            .expect("states")
            .iter()
            .map(|slot| slot.state)
            .collect()
    }

    #[test]
    fn start_all_launches_each_kind_in_its_slot() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider.clone(), settings());

        manager.start_all(Mode::Production).expect("start");

        let inputs = provider.snapshot(|s| s.inputs.clone());
        assert_eq!(inputs.len(), 4);
        assert_eq!(
            inputs[2],
            (
                2,
                "exec /opt/bin/swarm mission --slot 2 --kind backtester --mode production"
                    .to_string()
            )
        );
        assert_eq!(states(&manager), vec![WorkerState::Running; 4]);
        assert!(manager.is_running().expect("running"));
        let slots = manager.worker_states().expect("states");
        assert_eq!(slots[0].context_ref.as_deref(), Some("fake:0"));
    }

    #[test]
    fn failed_grid_destroys_context_and_marks_error() {
        let provider = FakeProvider::with_state(FakeProviderState {
            fail_grid: true,
            ..FakeProviderState::default()
        });
        let manager = LifecycleManager::new(provider.clone(), settings());

        let err = manager.start_all(Mode::Research).expect_err("grid fails");

        assert!(err.to_string().contains("grid creation failed"));
        assert!(!provider.snapshot(|s| s.exists));
        let slots = manager.worker_states().expect("states");
        assert!(slots.iter().all(|slot| slot.state == WorkerState::Error));
        assert!(slots[3].last_error.as_deref().is_some_and(|e| e.contains("grid")));
    }

    #[test]
    fn start_worker_refuses_running_slot() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider.clone(), settings());
        let err = manager
            .start_worker(WorkerKind::Converter, Mode::Research)
            .expect_err("no context");
        assert!(err.downcast_ref::<ContextMissingError>().is_some());

        manager.start_all(Mode::Research).expect("start");
        let err = manager
            .start_worker(WorkerKind::Converter, Mode::Research)
            .expect_err("already running");
        assert_eq!(
            err.downcast_ref::<WorkerAlreadyRunningError>(),
            Some(&WorkerAlreadyRunningError {
                kind: WorkerKind::Converter
            })
        );
    }

    #[test]
    fn stop_all_waits_for_exit_before_forcing() {
        let provider = FakeProvider::with_state(FakeProviderState {
            exit_on_interrupt: true,
            ..FakeProviderState::default()
        });
        let manager = LifecycleManager::new(provider.clone(), settings());
        manager.start_all(Mode::Research).expect("start");

        manager.stop_all().expect("stop");

        assert_eq!(provider.snapshot(|s| s.interrupts.clone()), vec![0, 1, 2, 3]);
        assert_eq!(provider.snapshot(|s| s.destroyed), 0);
        assert_eq!(states(&manager), vec![WorkerState::Stopped; 4]);
    }

    #[test]
    fn stop_all_force_destroys_after_grace() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider.clone(), settings());
        manager.start_all(Mode::Research).expect("start");

        manager.stop_all().expect("stop");

        assert_eq!(provider.snapshot(|s| s.destroyed), 1);
        assert!(!manager.is_running().expect("running"));
    }

    #[test]
    fn stop_worker_marks_stopped_after_grace() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider.clone(), settings());
        manager.start_all(Mode::Research).expect("start");

        let grace = manager.stop_worker(WorkerKind::Optimizer).expect("stop");
        assert_eq!(states(&manager)[3], WorkerState::Stopping);
        grace.join().expect("grace thread");

        assert_eq!(states(&manager)[3], WorkerState::Stopped);
        assert_eq!(states(&manager)[0], WorkerState::Running);
        assert!(manager.stop_worker(WorkerKind::Optimizer).is_err());
    }

    fn stopped_heartbeat(kind: WorkerKind) -> SlotStatus {
        SlotStatus {
            slot_id: kind.slot(),
            kind,
            mode: Mode::Research,
            state: WorkerState::Stopped,
            current_step: MissionStep::Stopped,
            session_number: 2,
            sessions_completed: 2,
            sessions_failed: 0,
            files_created_total: 3,
            detail: None,
            last_error: None,
            pid: 9,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn await_stop_returns_once_loop_reports_stopped() {
        let provider = FakeProvider::new();
        let mut slow = settings();
        slow.stop_grace = Duration::from_secs(30);
        let manager = LifecycleManager::new(provider, slow);
        manager.start_all(Mode::Research).expect("start");
        let store = MemoryStateStore::new();

        let grace = manager.stop_worker(WorkerKind::Converter).expect("stop");
        store
            .write_status(&stopped_heartbeat(WorkerKind::Converter))
            .expect("status");
        let started = Instant::now();
        let stop = manager
            .await_worker_stop(WorkerKind::Converter, &store, grace)
            .expect("await");

        assert!(stop.confirmed);
        assert_eq!(stop.slot.state, WorkerState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn await_stop_falls_back_to_grace_period() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider, settings());
        manager.start_all(Mode::Research).expect("start");
        let store = MemoryStateStore::new();

        let grace = manager.stop_worker(WorkerKind::Backtester).expect("stop");
        let stop = manager
            .await_worker_stop(WorkerKind::Backtester, &store, grace)
            .expect("await");

        assert!(!stop.confirmed);
        assert_eq!(stop.slot.state, WorkerState::Stopped);
        assert_eq!(states(&manager)[0], WorkerState::Running);
    }

    #[test]
    fn heartbeats_update_slot_table() {
        let provider = FakeProvider::new();
        let manager = LifecycleManager::new(provider.clone(), settings());
        manager.start_all(Mode::Research).expect("start");
        let store = MemoryStateStore::new();
        store
            .write_status(&SlotStatus {
                slot_id: 1,
                kind: WorkerKind::Converter,
                mode: Mode::Research,
                state: WorkerState::Idle,
                current_step: MissionStep::Cooldown,
                session_number: 6,
                sessions_completed: 4,
                sessions_failed: 2,
                files_created_total: 9,
                detail: None,
                last_error: None,
                pid: 7,
                timestamp: Utc::now(),
            })
            .expect("status");

        manager.sync_heartbeats(&store).expect("sync");

        let slot = &manager.worker_states().expect("states")[1];
        assert_eq!(slot.state, WorkerState::Idle);
        assert_eq!(slot.sessions_run, 6);
        assert_eq!(slot.tasks_completed, 4);
        assert_eq!(slot.current_task.as_deref(), Some("session 6 cooldown"));

        provider.destroy_context().expect("destroy");
        manager.sync_heartbeats(&store).expect("sync");
        assert_eq!(manager.worker_states().expect("states")[1].state, WorkerState::Stopped);
    }
}

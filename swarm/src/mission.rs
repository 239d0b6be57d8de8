//! Per-slot mission loop for `swarm mission`.
//!
//! Each iteration runs budget check, prompt assembly, invocation, validation,
//! classification, checkpoint, and cooldown in that order. The attempt being
//! run is always `checkpoint.session_number + 1`; the checkpoint only records
//! that number once the attempt has finished, so an attempt lost to a crash or
//! an interrupt is re-run under the same number on resume.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetPolicy, BudgetVerdict};
use crate::core::cancel::{CancelToken, Sleeper};
use crate::core::classifier::{Classification, Classifier, Observation};
use crate::core::recovery::{RecoveryAction, TimeoutBudget};
use crate::core::types::{CheckpointStatus, Mode, SessionOutcome, WorkerKind, WorkerState};
use crate::core::validator::validate_session;
use crate::io::artifacts::{StartMarker, load_artifacts};
use crate::io::checkpoint::Checkpoint;
use crate::io::config::SwarmConfig;
use crate::io::failure_log::FailureRecord;
use crate::io::paths::SwarmPaths;
use crate::io::prompt::{PromptBuilder, PromptContext, PromptRequest};
use crate::io::queue::QueueStore;
use crate::io::runtime::{AgentRuntime, InvocationRequest};
use crate::io::state_store::{SessionRecord, StateStore};
use crate::io::status_file::{MissionStep, SlotStatus};

/// Everything one slot's loop needs from the config, resolved for a mode.
#[derive(Debug, Clone)]
pub struct MissionSettings {
    pub kind: WorkerKind,
    pub mode: Mode,
    pub budget: BudgetPolicy,
    pub timeout: TimeoutBudget,
    pub cooldown: Duration,
    /// 0 = run until the budget or an interrupt stops the loop.
    pub max_iterations: u64,
    pub marker: String,
    pub output_limit_bytes: usize,
    pub log_tail_lines: usize,
    pub prompt_budget_bytes: usize,
    pub interrupt_grace: Duration,
    /// 0 disables the extra pause.
    pub max_consecutive_failures: u32,
    pub consecutive_failure_pause: Duration,
    pub artifact_dirs: Vec<String>,
    /// Shell prefix agents use to reach the queues.
    pub queue_command: String,
    pub profile: BTreeMap<String, String>,
}

impl MissionSettings {
    pub fn from_config(cfg: &SwarmConfig, kind: WorkerKind, mode: Mode) -> Self {
        let mission = &cfg.mission;
        Self {
            kind,
            mode,
            budget: cfg.budget_policy(mode),
            timeout: cfg.timeout_budget(mode),
            cooldown: Duration::from_secs(mission.cooldown_secs),
            max_iterations: mission.max_iterations,
            marker: mission.completion_marker.clone(),
            output_limit_bytes: mission.output_limit_bytes,
            log_tail_lines: mission.log_tail_lines,
            prompt_budget_bytes: mission.prompt_budget_bytes,
            interrupt_grace: Duration::from_secs(mission.interrupt_grace_secs),
            max_consecutive_failures: mission.max_consecutive_failures,
            consecutive_failure_pause: Duration::from_secs(mission.consecutive_failure_pause_secs),
            artifact_dirs: mission.artifact_dirs.clone(),
            queue_command: "swarm queue".to_string(),
            profile: cfg.profile.clone(),
        }
    }
}

/// Collaborators the loop drives. Tests swap in scripted fakes.
pub struct MissionEnv<'a, R, S, Z> {
    pub paths: &'a SwarmPaths,
    pub runtime: &'a R,
    pub store: &'a S,
    pub sleeper: &'a Z,
    pub classifier: &'a Classifier,
    pub cancel: &'a CancelToken,
}

/// Reason why `run_mission` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// One of the two spend checks tripped before the next session.
    BudgetExceeded(BudgetVerdict),
    /// Cancelled by a signal or the lifecycle manager.
    Interrupted,
    /// The configured iteration cap was reached.
    MaxIterations { max_iterations: u64 },
}

/// Summary of one `run_mission` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionOutcome {
    pub kind: WorkerKind,
    /// Checkpointed session number when the loop started.
    pub started_at_session: u64,
    pub sessions_run: u64,
    /// Checkpointed session number when the loop stopped.
    pub last_session: u64,
    pub stop: LoopStop,
}

/// What one completed attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_number: u64,
    pub outcome: SessionOutcome,
    pub classification: Option<Classification>,
    pub files_created: u64,
    pub timeout: Duration,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Run sessions for one slot until the budget, an interrupt, or the
/// iteration cap stops it.
///
/// Recoverable session failures are classified and handled inside the loop.
/// Fatal errors (missing template, missing runtime binary, state I/O) leave
/// an error heartbeat and are returned.
#[instrument(skip_all, fields(kind = %settings.kind, mode = %settings.mode))]
pub fn run_mission<R, S, Z, F>(
    env: &MissionEnv<'_, R, S, Z>,
    settings: &MissionSettings,
    mut on_session: F,
) -> Result<MissionOutcome>
where
    R: AgentRuntime,
    S: StateStore,
    Z: Sleeper,
    F: FnMut(&SessionReport),
{
    let kind = settings.kind;
    let mut checkpoint = match env.store.load_checkpoint(kind.slot())? {
        Some(checkpoint) if checkpoint.kind != kind => {
            return Err(anyhow!(
                "checkpoint for slot {} belongs to {}, not {kind}",
                kind.slot(),
                checkpoint.kind
            ));
        }
        Some(checkpoint) => checkpoint,
        None => Checkpoint::fresh(kind, settings.timeout.current().as_secs()),
    };
    let mut timeout = settings
        .timeout
        .resumed(Some(Duration::from_secs(checkpoint.timeout_secs)));
    let started_at_session = checkpoint.session_number;
    info!(
        session = started_at_session,
        timeout_secs = timeout.current().as_secs(),
        "mission starting"
    );

    let heartbeat = Heartbeat::new(env.store, settings);
    heartbeat.beat(
        &checkpoint,
        WorkerState::Starting,
        MissionStep::Starting,
        checkpoint.session_number,
        None,
    );

    let mut sessions_run = 0u64;
    let stopped = drive(
        env,
        settings,
        &heartbeat,
        &mut checkpoint,
        &mut timeout,
        &mut sessions_run,
        &mut on_session,
    );
    let stop = match stopped {
        Ok(stop) => stop,
        Err(err) => {
            heartbeat.failed(&checkpoint, &err);
            return Err(err);
        }
    };

    let (status, detail) = match &stop {
        LoopStop::BudgetExceeded(verdict) => {
            info!(summary = %verdict.summary(), "mission complete");
            (CheckpointStatus::Complete, verdict.summary())
        }
        LoopStop::Interrupted => {
            info!(session = checkpoint.session_number, "mission interrupted");
            (CheckpointStatus::Interrupted, "interrupted".to_string())
        }
        LoopStop::MaxIterations { max_iterations } => {
            info!(max_iterations, "iteration cap reached");
            (
                CheckpointStatus::Interrupted,
                format!("stopped after {max_iterations} iteration(s)"),
            )
        }
    };
    checkpoint.status = status;
    checkpoint.timestamp = Utc::now();
    if let Err(err) = env.store.save_checkpoint(&checkpoint) {
        heartbeat.failed(&checkpoint, &err);
        return Err(err);
    }
    heartbeat.beat(
        &checkpoint,
        WorkerState::Stopped,
        MissionStep::Stopped,
        checkpoint.session_number,
        Some(detail),
    );

    Ok(MissionOutcome {
        kind,
        started_at_session,
        sessions_run,
        last_session: checkpoint.session_number,
        stop,
    })
}

fn drive<R, S, Z, F>(
    env: &MissionEnv<'_, R, S, Z>,
    settings: &MissionSettings,
    heartbeat: &Heartbeat<'_, S>,
    checkpoint: &mut Checkpoint,
    timeout: &mut TimeoutBudget,
    sessions_run: &mut u64,
    on_session: &mut F,
) -> Result<LoopStop>
where
    R: AgentRuntime,
    S: StateStore,
    Z: Sleeper,
    F: FnMut(&SessionReport),
{
    loop {
        if env.cancel.is_cancelled() {
            return Ok(LoopStop::Interrupted);
        }
        if settings.max_iterations > 0 && *sessions_run >= settings.max_iterations {
            return Ok(LoopStop::MaxIterations {
                max_iterations: settings.max_iterations,
            });
        }

        heartbeat.beat(
            checkpoint,
            WorkerState::Running,
            MissionStep::Budget,
            checkpoint.session_number,
            None,
        );
        let verdict = settings.budget.check(
            checkpoint.session_number,
            checkpoint.tokens_in_total,
            checkpoint.tokens_out_total,
        );
        if verdict.is_exceeded() {
            return Ok(LoopStop::BudgetExceeded(verdict));
        }

        match run_session(env, settings, checkpoint, timeout)? {
            Some(report) => {
                *sessions_run += 1;
                on_session(&report);
            }
            None => return Ok(LoopStop::Interrupted),
        }

        if env.cancel.is_cancelled() {
            return Ok(LoopStop::Interrupted);
        }
        heartbeat.beat(
            checkpoint,
            WorkerState::Idle,
            MissionStep::Cooldown,
            checkpoint.session_number,
            None,
        );
        env.sleeper.pause(settings.cooldown, env.cancel);
    }
}

/// Run attempt `checkpoint.session_number + 1`.
///
/// Returns `None` when the attempt was interrupted; nothing is recorded for
/// it and the checkpoint is left untouched.
#[instrument(skip_all, fields(session = checkpoint.next_session()))]
pub fn run_session<R, S, Z>(
    env: &MissionEnv<'_, R, S, Z>,
    settings: &MissionSettings,
    checkpoint: &mut Checkpoint,
    timeout: &mut TimeoutBudget,
) -> Result<Option<SessionReport>>
where
    R: AgentRuntime,
    S: StateStore,
    Z: Sleeper,
{
    let kind = settings.kind;
    let slot = kind.slot();
    let session_number = checkpoint.next_session();
    let started_at = Utc::now();
    let clock = Instant::now();
    let heartbeat = Heartbeat::new(env.store, settings);
    let beat = |step: MissionStep, detail: Option<String>| {
        heartbeat.beat(checkpoint, WorkerState::Running, step, session_number, detail);
    };

    beat(MissionStep::Prompt, None);
    let queue_depths = QueueStore::new(&env.paths.queues_dir)
        .pipeline_depths()
        .unwrap_or_else(|err| {
            warn!(err = %err, "cannot read queue depths");
            Vec::new()
        });
    let context = PromptContext::gather(
        env.paths,
        &PromptRequest {
            kind,
            mode: settings.mode,
            session_number,
            marker: &settings.marker,
            queue_command: &settings.queue_command,
            profile: &settings.profile,
            queue_depths: &queue_depths,
            tail_lines: settings.log_tail_lines,
        },
    )?;
    let prompt = PromptBuilder::new(settings.prompt_budget_bytes).build(env.paths, &context)?;

    let session_timeout = timeout.current();
    beat(
        MissionStep::Invoke,
        Some(format!("timeout {}s", session_timeout.as_secs())),
    );
    let marker = StartMarker::take(
        &env
            .paths
            .artifact_roots(&settings.artifact_dirs, settings.kind),
    );
    let invocation = env.runtime.invoke(
        &InvocationRequest {
            workdir: env.paths.root.clone(),
            prompt,
            timeout: session_timeout,
            output_limit_bytes: settings.output_limit_bytes,
            log_path: env.paths.session_output_path(slot, session_number),
            interrupt_grace: settings.interrupt_grace,
        },
        env.cancel,
    )?;
    if invocation.interrupted {
        info!(session = session_number, "session interrupted; not checkpointed");
        return Ok(None);
    }

    beat(MissionStep::Validate, None);
    let artifacts = load_artifacts(&marker.scan_new_files());
    let report = validate_session(&invocation.output, &settings.marker, &artifacts);
    debug!(detail = %report.detail(), "validated session");

    beat(MissionStep::Classify, None);
    let classification = env.classifier.classify(&Observation {
        output: &invocation.output,
        exit_code: invocation.exit_code,
        timed_out: invocation.timed_out,
        report: &report,
    });
    if let Some(found) = &classification {
        warn!(
            failure = %found.kind,
            action = found.action.label(),
            detail = %found.detail,
            "session failed"
        );
        env.store
            .append_failure(&FailureRecord::from_classification(kind, session_number, found))?;
        if found.action == RecoveryAction::ExtendTimeout {
            let extended = timeout.extend();
            info!(timeout_secs = extended.as_secs(), "extended session timeout");
        }
    }

    let outcome = if classification.is_none() {
        SessionOutcome::Valid
    } else {
        SessionOutcome::Failed
    };
    let files_created = report.accepted() as u64;
    let mut next = checkpoint.clone();
    next.session_number = session_number;
    match outcome {
        SessionOutcome::Valid => {
            next.sessions_completed += 1;
            next.consecutive_failures = 0;
        }
        SessionOutcome::Failed => {
            next.sessions_failed += 1;
            next.consecutive_failures += 1;
        }
    }
    let streak_pause = settings.max_consecutive_failures > 0
        && next.consecutive_failures >= settings.max_consecutive_failures;
    if streak_pause {
        next.consecutive_failures = 0;
    }
    next.files_created_total += files_created;
    next.tokens_in_total += invocation.tokens_in;
    next.tokens_out_total += invocation.tokens_out;
    next.timeout_secs = timeout.current().as_secs();
    next.status = CheckpointStatus::Running;
    next.timestamp = Utc::now();

    beat(MissionStep::Checkpoint, None);
    env.store.save_checkpoint(&next)?;
    *checkpoint = next;

    env.store.append_session(&SessionRecord {
        slot_id: slot,
        session_number,
        started_at,
        timeout_secs: session_timeout.as_secs(),
        outcome,
        failure_kind: classification.as_ref().map(|found| found.kind),
        files_created,
        tokens_in: invocation.tokens_in,
        tokens_out: invocation.tokens_out,
        duration_ms: clock.elapsed().as_millis() as u64,
        exit_code: invocation.exit_code,
    })?;
    info!(
        session = session_number,
        outcome = ?outcome,
        files_created,
        estimated_spend_usd = settings.budget.estimated_spend(session_number),
        "session finished"
    );

    if let Some(pause) = classification
        .as_ref()
        .and_then(|found| found.action.pause_duration(&mut rand::thread_rng()))
    {
        heartbeat.beat(
            checkpoint,
            WorkerState::Idle,
            MissionStep::Backoff,
            session_number,
            Some(format!("backing off {}s", pause.as_secs())),
        );
        env.sleeper.pause(pause, env.cancel);
    }
    if streak_pause && !env.cancel.is_cancelled() {
        warn!(
            failures = settings.max_consecutive_failures,
            pause_secs = settings.consecutive_failure_pause.as_secs(),
            "consecutive failure limit reached"
        );
        heartbeat.beat(
            checkpoint,
            WorkerState::Idle,
            MissionStep::Backoff,
            session_number,
            Some(format!(
                "{} consecutive failures; pausing {}s",
                settings.max_consecutive_failures,
                settings.consecutive_failure_pause.as_secs()
            )),
        );
        env.sleeper.pause(settings.consecutive_failure_pause, env.cancel);
    }

    Ok(Some(SessionReport {
        session_number,
        outcome,
        classification,
        files_created,
        timeout: session_timeout,
        tokens_in: invocation.tokens_in,
        tokens_out: invocation.tokens_out,
    }))
}

/// Status file writer for one slot. Write failures are logged, not fatal.
struct Heartbeat<'a, S> {
    store: &'a S,
    kind: WorkerKind,
    mode: Mode,
}

impl<'a, S: StateStore> Heartbeat<'a, S> {
    fn new(store: &'a S, settings: &MissionSettings) -> Self {
        Self {
            store,
            kind: settings.kind,
            mode: settings.mode,
        }
    }

    fn beat(
        &self,
        checkpoint: &Checkpoint,
        state: WorkerState,
        step: MissionStep,
        session_number: u64,
        detail: Option<String>,
    ) {
        self.write(self.status(checkpoint, state, step, session_number, detail, None));
    }

    fn failed(&self, checkpoint: &Checkpoint, err: &anyhow::Error) {
        self.write(self.status(
            checkpoint,
            WorkerState::Error,
            MissionStep::Stopped,
            checkpoint.session_number,
            None,
            Some(format!("{err:#}")),
        ));
    }

    fn status(
        &self,
        checkpoint: &Checkpoint,
        state: WorkerState,
        step: MissionStep,
        session_number: u64,
        detail: Option<String>,
        last_error: Option<String>,
    ) -> SlotStatus {
        SlotStatus {
            slot_id: self.kind.slot(),
            kind: self.kind,
            mode: self.mode,
            state,
            current_step: step,
            session_number,
            sessions_completed: checkpoint.sessions_completed,
            sessions_failed: checkpoint.sessions_failed,
            files_created_total: checkpoint.files_created_total,
            detail,
            last_error,
            pid: std::process::id(),
            timestamp: Utc::now(),
        }
    }

    fn write(&self, status: SlotStatus) {
        if let Err(err) = self.store.write_status(&status) {
            warn!(err = %err, step = %status.current_step, "failed to write heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::FailureKind;
    use crate::io::prompt::MissingTemplateError;
    use crate::io::runtime::RuntimeBinaryMissing;
    use crate::io::state_store::MemoryStateStore;
    use crate::test_support::{RecordingSleeper, ScriptedRuntime, ScriptedSession, workspace};

    const REPORT: &str = r#"{"strategy": "orb", "trades": 42, "sharpe": 1.3}"#;

    fn settings(kind: WorkerKind) -> MissionSettings {
        MissionSettings::from_config(&SwarmConfig::default(), kind, Mode::Research)
    }

    fn run(
        paths: &SwarmPaths,
        runtime: &ScriptedRuntime,
        store: &MemoryStateStore,
        sleeper: &RecordingSleeper,
        settings: &MissionSettings,
    ) -> Result<MissionOutcome> {
        let classifier = Classifier::default();
        let cancel = CancelToken::new();
        let env = MissionEnv {
            paths,
            runtime,
            store,
            sleeper,
            classifier: &classifier,
            cancel: &cancel,
        };
        run_mission(&env, settings, |_| {})
    }

    #[test]
    fn valid_session_advances_checkpoint_and_logs_record() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![
            ScriptedSession::valid(&[("output/backtests/orb.json", REPORT)]).with_tokens(1200, 300),
        ]);
        let store = MemoryStateStore::new();
        let sleeper = RecordingSleeper::default();
        let mut settings = settings(WorkerKind::Backtester);
        settings.max_iterations = 1;

        let outcome = run(&paths, &runtime, &store, &sleeper, &settings).expect("mission");

        assert_eq!(outcome.sessions_run, 1);
        assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 1 });
        let checkpoint = store.load_checkpoint(2).expect("load").expect("checkpoint");
        assert_eq!(checkpoint.session_number, 1);
        assert_eq!(checkpoint.sessions_completed, 1);
        assert_eq!(checkpoint.files_created_total, 1);
        assert_eq!(checkpoint.tokens_in_total, 1200);
        assert_eq!(checkpoint.status, CheckpointStatus::Interrupted);

        let sessions = store.sessions(2).expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].outcome, SessionOutcome::Valid);
        assert!(store.failures().expect("failures").is_empty());
        assert_eq!(sleeper.pauses(), vec![Duration::from_secs(5)]);

        let prompt = &runtime.requests()[0].prompt;
        assert!(prompt.contains("Backtester Contract"));
        assert!(prompt.contains("SESSION_COMPLETE"));
    }

    /// Heartbeats walk the documented steps in order for one session.
    #[test]
    fn heartbeat_tracks_each_step() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::valid(&[(
            "output/r.json",
            REPORT,
        )])]);
        let store = MemoryStateStore::new();
        let mut settings = settings(WorkerKind::Researcher);
        settings.max_iterations = 1;

        run(&paths, &runtime, &store, &RecordingSleeper::default(), &settings).expect("mission");

        let steps: Vec<MissionStep> = store
            .status_writes()
            .expect("writes")
            .iter()
            .map(|s| s.current_step)
            .collect();
        assert_eq!(
            steps,
            vec![
                MissionStep::Starting,
                MissionStep::Budget,
                MissionStep::Prompt,
                MissionStep::Invoke,
                MissionStep::Validate,
                MissionStep::Classify,
                MissionStep::Checkpoint,
                MissionStep::Cooldown,
                MissionStep::Stopped,
            ]
        );
        let last = store.read_status(0).expect("read").expect("status");
        assert_eq!(last.state, WorkerState::Stopped);
        assert_eq!(last.sessions_completed, 1);
    }

    #[test]
    fn missing_marker_is_recorded_as_no_output() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::failing("did some work", 0)]);
        let store = MemoryStateStore::new();
        let mut settings = settings(WorkerKind::Converter);
        settings.max_iterations = 1;

        let outcome = run(&paths, &runtime, &store, &RecordingSleeper::default(), &settings)
            .expect("mission");

        assert_eq!(outcome.last_session, 1);
        let failures = store.failures().expect("failures");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].failure_kind, FailureKind::NoOutput);
        let checkpoint = store.load_checkpoint(1).expect("load").expect("checkpoint");
        assert_eq!(checkpoint.sessions_failed, 1);
        assert_eq!(checkpoint.consecutive_failures, 1);
    }

    #[test]
    fn timeout_extends_next_session_up_to_cap() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![
            ScriptedSession::timed_out(),
            ScriptedSession::timed_out(),
            ScriptedSession::timed_out(),
        ]);
        let store = MemoryStateStore::new();
        let mut settings = settings(WorkerKind::Optimizer);
        settings.max_iterations = 3;

        run(&paths, &runtime, &store, &RecordingSleeper::default(), &settings).expect("mission");

        let timeouts: Vec<u64> = runtime
            .requests()
            .iter()
            .map(|r| r.timeout.as_secs())
            .collect();
        assert_eq!(timeouts, vec![1800, 2400, 3000]);
        let checkpoint = store.load_checkpoint(3).expect("load").expect("checkpoint");
        assert_eq!(checkpoint.timeout_secs, 3600);
        assert!(
            store
                .failures()
                .expect("failures")
                .iter()
                .all(|f| f.failure_kind == FailureKind::Timeout)
        );
    }

    #[test]
    fn rate_limit_backs_off_before_cooldown() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::failing(
            "Traceback (most recent call last):\nanthropic.RateLimitError: 429 Too Many Requests",
            1,
        )]);
        let store = MemoryStateStore::new();
        let sleeper = RecordingSleeper::default();
        let mut settings = settings(WorkerKind::Researcher);
        settings.max_iterations = 1;

        run(&paths, &runtime, &store, &sleeper, &settings).expect("mission");

        let pauses = sleeper.pauses();
        assert_eq!(pauses.len(), 2);
        assert!((300..=600).contains(&pauses[0].as_secs()));
        assert_eq!(pauses[1], Duration::from_secs(5));
        assert_eq!(
            store.failures().expect("failures")[0].failure_kind,
            FailureKind::RateLimit
        );
    }

    #[test]
    fn budget_gate_stops_before_invoking() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::valid(&[])]);
        let store = MemoryStateStore::new();
        let mut checkpoint = Checkpoint::fresh(WorkerKind::Researcher, 1800);
        checkpoint.session_number = 1200;
        store.save_checkpoint(&checkpoint).expect("seed");

        let outcome = run(
            &paths,
            &runtime,
            &store,
            &RecordingSleeper::default(),
            &settings(WorkerKind::Researcher),
        )
        .expect("mission");

        assert!(matches!(
            outcome.stop,
            LoopStop::BudgetExceeded(BudgetVerdict::SessionsExhausted {
                sessions: 1200,
                max_sessions: 1200
            })
        ));
        assert_eq!(runtime.remaining(), 1);
        let saved = store.load_checkpoint(0).expect("load").expect("checkpoint");
        assert_eq!(saved.status, CheckpointStatus::Complete);
        assert_eq!(saved.session_number, 1200);
    }

    #[test]
    fn interrupted_session_is_not_checkpointed() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![
            ScriptedSession::valid(&[("output/a.json", REPORT)]),
            ScriptedSession::interrupted(),
        ]);
        let store = MemoryStateStore::new();

        let outcome = run(
            &paths,
            &runtime,
            &store,
            &RecordingSleeper::default(),
            &settings(WorkerKind::Backtester),
        )
        .expect("mission");

        assert_eq!(outcome.stop, LoopStop::Interrupted);
        assert_eq!(outcome.sessions_run, 1);
        let checkpoint = store.load_checkpoint(2).expect("load").expect("checkpoint");
        assert_eq!(checkpoint.session_number, 1);
        assert_eq!(checkpoint.status, CheckpointStatus::Interrupted);
        assert_eq!(store.sessions(2).expect("sessions").len(), 1);
    }

    #[test]
    fn missing_template_is_fatal_with_error_heartbeat() {
        let (_temp, paths) = workspace().expect("workspace");
        fs::remove_file(paths.template_path(WorkerKind::Converter)).expect("remove template");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::valid(&[])]);
        let store = MemoryStateStore::new();

        let err = run(
            &paths,
            &runtime,
            &store,
            &RecordingSleeper::default(),
            &settings(WorkerKind::Converter),
        )
        .expect_err("missing template");

        assert!(err.downcast_ref::<MissingTemplateError>().is_some());
        assert!(runtime.requests().is_empty());
        let status = store.read_status(1).expect("read").expect("status");
        assert_eq!(status.state, WorkerState::Error);
        assert!(status.last_error.expect("last error").contains("converter.md"));
        assert_eq!(store.load_checkpoint(1).expect("load"), None);
    }

    #[test]
    fn missing_runtime_binary_is_fatal() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![ScriptedSession::missing_binary()]);
        let store = MemoryStateStore::new();

        let err = run(
            &paths,
            &runtime,
            &store,
            &RecordingSleeper::default(),
            &settings(WorkerKind::Researcher),
        )
        .expect_err("missing binary");

        assert!(err.downcast_ref::<RuntimeBinaryMissing>().is_some());
        assert!(store.sessions(0).expect("sessions").is_empty());
    }

    #[test]
    fn consecutive_failures_trigger_extra_pause() {
        let (_temp, paths) = workspace().expect("workspace");
        let runtime = ScriptedRuntime::new(vec![
            ScriptedSession::failing("boom", 1),
            ScriptedSession::failing("boom", 1),
        ]);
        let store = MemoryStateStore::new();
        let sleeper = RecordingSleeper::default();
        let mut settings = settings(WorkerKind::Converter);
        settings.max_iterations = 2;
        settings.max_consecutive_failures = 2;
        settings.consecutive_failure_pause = Duration::from_secs(90);

        run(&paths, &runtime, &store, &sleeper, &settings).expect("mission");

        assert_eq!(
            sleeper.pauses(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(90),
                Duration::from_secs(5),
            ]
        );
        let checkpoint = store.load_checkpoint(1).expect("load").expect("checkpoint");
        assert_eq!(checkpoint.sessions_failed, 2);
        assert_eq!(checkpoint.consecutive_failures, 0);
    }

    #[test]
    fn checkpoint_for_another_kind_is_rejected() {
        let (_temp, paths) = workspace().expect("workspace");
        let store = MemoryStateStore::new();
        let mut foreign = Checkpoint::fresh(WorkerKind::Researcher, 60);
        foreign.slot_id = 1;
        store.save_checkpoint(&foreign).expect("seed");

        let err = run(
            &paths,
            &ScriptedRuntime::default(),
            &store,
            &RecordingSleeper::default(),
            &settings(WorkerKind::Converter),
        )
        .expect_err("kind mismatch");
        assert!(err.to_string().contains("belongs to researcher"));
    }
}

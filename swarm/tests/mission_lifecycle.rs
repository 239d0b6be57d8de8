//! Loop-level tests for checkpoint numbering across crashes, interrupts, and
//! resumes, driven through the public mission API.

use std::fs;
use std::time::Duration;

use swarm::core::cancel::CancelToken;
use swarm::core::classifier::Classifier;
use swarm::core::types::{CheckpointStatus, Mode, SessionOutcome, WorkerKind, WorkerState};
use swarm::io::config::SwarmConfig;
use swarm::io::paths::SwarmPaths;
use swarm::io::state_store::{FileStateStore, MemoryStateStore, StateStore};
use swarm::mission::{LoopStop, MissionEnv, MissionOutcome, MissionSettings, run_mission};
use swarm::test_support::{RecordingSleeper, ScriptedRuntime, ScriptedSession, workspace};

const BACKTEST: &str = r#"{"in_sample": {"trades": 31}, "out_of_sample": {"trades": 9}}"#;
const EMPTY_BACKTEST: &str = r#"{"trades": 0, "sharpe": null}"#;

fn settings(max_iterations: u64) -> MissionSettings {
    let mut settings =
        MissionSettings::from_config(&SwarmConfig::default(), WorkerKind::Backtester, Mode::Research);
    settings.max_iterations = max_iterations;
    settings.cooldown = Duration::ZERO;
    settings
}

fn run<S: StateStore>(
    paths: &SwarmPaths,
    runtime: &ScriptedRuntime,
    store: &S,
    settings: &MissionSettings,
) -> anyhow::Result<MissionOutcome> {
    let classifier = Classifier::default();
    let cancel = CancelToken::new();
    run_mission(
        &MissionEnv {
            paths,
            runtime,
            store,
            sleeper: &RecordingSleeper::default(),
            classifier: &classifier,
            cancel: &cancel,
        },
        settings,
        |_| {},
    )
}

/// A crash before the checkpoint write loses the attempt: the resumed loop
/// re-runs it under the same session number, and numbering stays equal to
/// the count of checkpointed attempts.
#[test]
fn crash_before_checkpoint_reruns_same_session_number() {
    let (_temp, paths) = workspace().expect("workspace");
    let store = MemoryStateStore::new();

    let first = ScriptedRuntime::new(vec![
        ScriptedSession::valid(&[("output/bt/a.json", BACKTEST)]),
        ScriptedSession::valid(&[("output/bt/b.json", BACKTEST)]),
    ]);
    let outcome = run(&paths, &first, &store, &settings(2)).expect("first run");
    assert_eq!(outcome.last_session, 2);

    store.fail_checkpoint_writes(true).expect("toggle");
    let crashing = ScriptedRuntime::new(vec![ScriptedSession::valid(&[(
        "output/bt/c.json",
        BACKTEST,
    )])]);
    run(&paths, &crashing, &store, &settings(0)).expect_err("checkpoint write fails");
    assert_eq!(
        store.load_checkpoint(2).expect("load").map(|c| c.session_number),
        Some(2)
    );
    assert_eq!(
        store.read_status(2).expect("status").map(|s| s.state),
        Some(WorkerState::Error)
    );

    store.fail_checkpoint_writes(false).expect("toggle");
    let resumed = ScriptedRuntime::new(vec![ScriptedSession::valid(&[(
        "output/bt/c2.json",
        BACKTEST,
    )])]);
    let outcome = run(&paths, &resumed, &store, &settings(1)).expect("resume");
    assert_eq!(outcome.started_at_session, 2);
    assert_eq!(outcome.last_session, 3);

    let numbers: Vec<u64> = store
        .checkpoint_writes()
        .expect("writes")
        .iter()
        .map(|c| c.session_number)
        .collect();
    assert!(numbers.windows(2).all(|pair| pair[0] <= pair[1]));
    let sessions: Vec<u64> = store
        .sessions(2)
        .expect("sessions")
        .iter()
        .map(|s| s.session_number)
        .collect();
    assert_eq!(sessions, vec![1, 2, 3]);
}

/// Full file-backed run: the `.swarm/` layout carries checkpoint, status,
/// session log, failure log, and captured output.
#[test]
fn file_store_run_persists_every_artifact() {
    let (_temp, paths) = workspace().expect("workspace");
    let store = FileStateStore::new(paths.clone());
    let runtime = ScriptedRuntime::new(vec![
        ScriptedSession::valid(&[("output/bt/zero.json", EMPTY_BACKTEST)]),
        ScriptedSession::valid(&[("output/bt/orb.json", BACKTEST)]).with_tokens(5000, 800),
    ]);

    let outcome = run(&paths, &runtime, &store, &settings(2)).expect("mission");
    assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: 2 });

    let checkpoint = store.load_checkpoint(2).expect("load").expect("checkpoint");
    assert_eq!(checkpoint.session_number, 2);
    assert_eq!(checkpoint.sessions_completed, 1);
    assert_eq!(checkpoint.sessions_failed, 1);
    assert_eq!(checkpoint.files_created_total, 1);
    assert_eq!(checkpoint.tokens_out_total, 800);
    assert_eq!(checkpoint.status, CheckpointStatus::Interrupted);

    let sessions = store.sessions(2).expect("sessions");
    assert_eq!(
        sessions.iter().map(|s| s.outcome).collect::<Vec<_>>(),
        vec![SessionOutcome::Failed, SessionOutcome::Valid]
    );
    let failures = store.failures().expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].failure_kind.as_str(), "no_trades");
    assert!(paths.session_output_path(2, 2).is_file());

    let status: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(paths.status_path(2)).expect("status file"),
    )
    .expect("status json");
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["current_step"], "stopped");

    // The second prompt carries the first session's captured output.
    let requests = runtime.requests();
    assert!(requests[1].prompt.contains("SESSION_COMPLETE"));
    assert!(requests[1].prompt.contains("Previous Session"));
}

#[test]
fn interrupt_then_resume_continues_numbering() {
    let (_temp, paths) = workspace().expect("workspace");
    let store = MemoryStateStore::new();
    let runtime = ScriptedRuntime::new(vec![
        ScriptedSession::valid(&[("output/bt/a.json", BACKTEST)]),
        ScriptedSession::interrupted(),
    ]);

    let outcome = run(&paths, &runtime, &store, &settings(0)).expect("mission");
    assert_eq!(outcome.stop, LoopStop::Interrupted);
    let checkpoint = store.load_checkpoint(2).expect("load").expect("checkpoint");
    assert_eq!(
        (checkpoint.session_number, checkpoint.status),
        (1, CheckpointStatus::Interrupted)
    );

    let resumed = ScriptedRuntime::new(vec![ScriptedSession::valid(&[(
        "output/bt/b.json",
        BACKTEST,
    )])]);
    let outcome = run(&paths, &resumed, &store, &settings(1)).expect("resume");
    assert_eq!((outcome.started_at_session, outcome.last_session), (1, 2));
    assert_eq!(
        resumed.requests()[0].log_path,
        paths.session_output_path(2, 2)
    );
}

#[test]
fn token_spend_stops_loop_even_when_heuristic_allows_more() {
    let (_temp, paths) = workspace().expect("workspace");
    let store = MemoryStateStore::new();
    let mut settings = settings(0);
    settings.budget.cap_usd = 1.0;
    // $15 of output tokens in one session trips the token check at session 1 of 24.
    let runtime = ScriptedRuntime::new(vec![
        ScriptedSession::valid(&[("output/bt/a.json", BACKTEST)]).with_tokens(0, 1_000_000),
        ScriptedSession::valid(&[("output/bt/b.json", BACKTEST)]),
    ]);

    let outcome = run(&paths, &runtime, &store, &settings).expect("mission");

    assert!(matches!(outcome.stop, LoopStop::BudgetExceeded(_)));
    assert_eq!(outcome.sessions_run, 1);
    assert_eq!(runtime.remaining(), 1);
    assert_eq!(
        store.load_checkpoint(2).expect("load").map(|c| c.status),
        Some(CheckpointStatus::Complete)
    );
}

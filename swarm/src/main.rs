//! Supervised mission loops for a four-stage research pipeline.
//!
//! `swarm start` hosts one loop per worker in a tmux session; each pane runs
//! `swarm mission`, which invokes the agent runtime session after session
//! until its budget runs out or it is interrupted.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use swarm::core::cancel::{CancelToken, ThreadSleeper};
use swarm::core::classifier::Classifier;
use swarm::core::types::{Mode, QueueName, WorkerKind};
use swarm::exit_codes;
use swarm::io::config::{SwarmConfig, load_config};
use swarm::health::{self, SystemTools, render_report};
use swarm::io::context::{ContextExistsError, ContextMissingError, TmuxProvider, shell_quote};
use swarm::io::paths::{InitOptions, SwarmPaths, init_layout};
use swarm::io::queue::{Priority, QueueEntry, QueueStore};
use swarm::io::runtime::ClaudeRuntime;
use swarm::io::state_store::FileStateStore;
use swarm::lifecycle::{LifecycleManager, LifecycleSettings, WorkerAlreadyRunningError};
use swarm::mission::{LoopStop, MissionEnv, MissionSettings, run_mission};
use swarm::status::{collect_snapshot, poll_snapshots, render_snapshot};

#[derive(Parser)]
#[command(
    name = "swarm",
    version,
    about = "Supervised mission loops for a four-stage research pipeline"
)]
struct Cli {
    /// Project root.
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.swarm/`, queues, prompt templates, pattern logs, and `swarm.toml`.
    Init {
        /// Overwrite existing swarm-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Start every worker in a new context, or one worker in the running context.
    Start {
        worker: Option<WorkerKind>,
        #[arg(long, default_value_t = Mode::Research)]
        mode: Mode,
    },
    /// Interrupt every worker and tear the context down, or interrupt one worker.
    Stop { worker: Option<WorkerKind> },
    /// Show workers, checkpoints, queue depths, and recent failures.
    Status {
        #[arg(long)]
        json: bool,
        /// Refresh every N seconds until interrupted.
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
        /// Recent failures to include.
        #[arg(long, default_value_t = 5)]
        failures: usize,
    },
    /// Run one slot's mission loop in the foreground.
    Mission {
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        kind: WorkerKind,
        #[arg(long, default_value_t = Mode::Research)]
        mode: Mode,
        /// Stop after N iterations (overrides `mission.max_iterations`).
        #[arg(long)]
        max_iterations: Option<u64>,
    },
    /// Check tools, templates, queues, and the execution context.
    Health {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or feed the hand-off queues.
    #[command(subcommand)]
    Queue(QueueCommand),
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Print the pending depth of every queue.
    Depth {
        #[arg(long)]
        json: bool,
    },
    /// Publish an entry atomically.
    Push {
        queue: QueueName,
        id: String,
        /// Entry payload as JSON.
        payload: String,
        #[arg(long, default_value_t = Priority::Medium)]
        priority: Priority,
        #[arg(long, default_value = "cli")]
        created_by: String,
    },
    /// Take the best pending entry; prints it as JSON, or `null` when empty.
    Claim {
        queue: QueueName,
        #[arg(long)]
        consumer: String,
    },
    /// Mark a claimed entry done.
    Complete {
        queue: QueueName,
        /// Claimed file name (or path) printed by `queue claim`.
        file: String,
        #[arg(long)]
        consumer: String,
    },
    /// Mark a claimed entry failed.
    Fail {
        queue: QueueName,
        file: String,
        #[arg(long)]
        consumer: String,
        #[arg(long)]
        reason: String,
    },
}

fn main() {
    swarm::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let root = cli.root;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Start { worker, mode } => cmd_start(&root, worker, mode),
        Command::Stop { worker } => cmd_stop(&root, worker),
        Command::Status {
            json,
            watch,
            failures,
        } => cmd_status(&root, json, watch, failures),
        Command::Mission {
            slot,
            kind,
            mode,
            max_iterations,
        } => cmd_mission(&root, slot, kind, mode, max_iterations),
        Command::Health { json } => cmd_health(&root, json),
        Command::Queue(QueueCommand::Depth { json }) => cmd_queue_depth(&root, json),
        Command::Queue(QueueCommand::Push {
            queue,
            id,
            payload,
            priority,
            created_by,
        }) => cmd_queue_push(&root, queue, &id, &payload, priority, &created_by),
        Command::Queue(QueueCommand::Claim { queue, consumer }) => {
            cmd_queue_claim(&root, queue, &consumer)
        }
        Command::Queue(QueueCommand::Complete {
            queue,
            file,
            consumer,
        }) => cmd_queue_finish(&root, queue, &file, &consumer, None),
        Command::Queue(QueueCommand::Fail {
            queue,
            file,
            consumer,
            reason,
        }) => cmd_queue_finish(&root, queue, &file, &consumer, Some(&reason)),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ContextExistsError>().is_some()
        || err.downcast_ref::<ContextMissingError>().is_some()
        || err.downcast_ref::<WorkerAlreadyRunningError>().is_some()
    {
        exit_codes::CONTEXT
    } else {
        exit_codes::INVALID
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let paths = init_layout(root, &InitOptions { force })?;
    println!("initialized swarm project in {}", paths.root.display());
    Ok(())
}

/// Resolve the project layout and config, requiring `swarm init` first.
fn open_project(root: &Path) -> Result<(SwarmPaths, SwarmConfig)> {
    let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
    let paths = SwarmPaths::new(root);
    if !paths.swarm_dir.is_dir() {
        return Err(anyhow!(
            "missing {} (run `swarm init`)",
            paths.swarm_dir.display()
        ));
    }
    let cfg = load_config(&paths.config_path)?;
    Ok((paths, cfg))
}

fn lifecycle(paths: &SwarmPaths, cfg: &SwarmConfig) -> Result<LifecycleManager<TmuxProvider>> {
    let provider = TmuxProvider::new(cfg.context.session_name.clone(), paths.root.clone());
    let settings =
        LifecycleSettings::for_current_exe(Duration::from_secs(cfg.context.stop_grace_secs))?;
    Ok(LifecycleManager::new(provider, settings))
}

fn cmd_start(root: &Path, worker: Option<WorkerKind>, mode: Mode) -> Result<()> {
    let (paths, cfg) = open_project(root)?;
    let report = health::preflight(&paths, &cfg, &SystemTools)?;
    for warning in report
        .results
        .iter()
        .filter(|r| r.status == health::CheckStatus::Warn)
    {
        warn!(check = warning.name, message = %warning.message, "preflight warning");
    }
    report.into_result()?;
    let manager = lifecycle(&paths, &cfg)?;
    match worker {
        None => {
            manager.start_all(mode)?;
            println!(
                "started 4 workers in tmux session '{}' ({mode} mode)",
                cfg.context.session_name
            );
        }
        Some(kind) => {
            manager.sync_heartbeats(&FileStateStore::new(paths.clone()))?;
            manager.start_worker(kind, mode)?;
            println!("started {kind} in slot {} ({mode} mode)", kind.slot());
        }
    }
    Ok(())
}

fn cmd_stop(root: &Path, worker: Option<WorkerKind>) -> Result<()> {
    let (paths, cfg) = open_project(root)?;
    let manager = lifecycle(&paths, &cfg)?;
    match worker {
        None => {
            manager.stop_all()?;
            println!("stopped all workers");
        }
        Some(kind) => {
            let store = FileStateStore::new(paths.clone());
            manager.sync_heartbeats(&store)?;
            let grace = manager.stop_worker(kind)?;
            println!("interrupt sent to {kind}; waiting up to {}s", cfg.context.stop_grace_secs);
            let stop = manager.await_worker_stop(kind, &store, grace)?;
            if stop.confirmed {
                println!("{kind} stopped ({})", stop.slot.state.as_str());
            } else {
                println!("{kind} did not report a stop within the grace period; marked stopped");
            }
        }
    }
    Ok(())
}

fn cmd_status(root: &Path, json: bool, watch: Option<u64>, failures: usize) -> Result<()> {
    let (paths, cfg) = open_project(root)?;
    let manager = lifecycle(&paths, &cfg)?;
    let store = FileStateStore::new(paths.clone());
    let queues = QueueStore::new(paths.queues_dir.clone());
    let collect = || collect_snapshot(&manager, &store, &queues, failures);
    let print = |snapshot: &swarm::status::StatusSnapshot| -> Result<()> {
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(snapshot).context("serialize status")?
            );
        } else {
            print!("{}", render_snapshot(snapshot));
        }
        Ok(())
    };

    let Some(secs) = watch else {
        return print(&collect()?);
    };
    let cancel = CancelToken::new();
    spawn_signal_listener(cancel.clone())?;
    let mut printed = Ok(());
    poll_snapshots(
        Duration::from_secs(secs.max(1)),
        &ThreadSleeper,
        &cancel,
        collect,
        |snapshot| {
            printed = print(snapshot);
            printed.is_ok()
        },
    )?;
    printed
}

fn cmd_mission(
    root: &Path,
    slot: u32,
    kind: WorkerKind,
    mode: Mode,
    max_iterations: Option<u64>,
) -> Result<()> {
    if kind.slot() != slot {
        return Err(anyhow!(
            "{kind} runs in slot {}, not slot {slot}",
            kind.slot()
        ));
    }
    let (paths, cfg) = open_project(root)?;
    let mut settings = MissionSettings::from_config(&cfg, kind, mode);
    if let Some(max_iterations) = max_iterations {
        settings.max_iterations = max_iterations;
    }
    let exe = std::env::current_exe().context("resolve current executable")?;
    settings.queue_command = format!(
        "{} -C {} queue",
        shell_quote(&exe.to_string_lossy()),
        shell_quote(&paths.root.to_string_lossy())
    );
    let runtime = ClaudeRuntime::new(cfg.runtime.command.clone())?;
    let store = FileStateStore::new(paths.clone());
    let classifier = Classifier::default();
    let cancel = CancelToken::new();
    spawn_signal_listener(cancel.clone())?;

    let env = MissionEnv {
        paths: &paths,
        runtime: &runtime,
        store: &store,
        sleeper: &ThreadSleeper,
        classifier: &classifier,
        cancel: &cancel,
    };
    let outcome = run_mission(&env, &settings, |report| {
        let failure = report
            .classification
            .as_ref()
            .map(|found| format!(" {} -> {}", found.kind, found.action.label()))
            .unwrap_or_default();
        println!(
            "[{kind}] session {}: {:?}, {} file(s){failure}",
            report.session_number, report.outcome, report.files_created
        );
    })?;

    let stop = match &outcome.stop {
        LoopStop::BudgetExceeded(verdict) => verdict.summary(),
        LoopStop::Interrupted => "interrupted".to_string(),
        LoopStop::MaxIterations { max_iterations } => {
            format!("reached {max_iterations} iteration(s)")
        }
    };
    println!(
        "[{kind}] stopped after {} session(s) this run (checkpoint at {}): {stop}",
        outcome.sessions_run, outcome.last_session
    );
    Ok(())
}

fn cmd_queue_depth(root: &Path, json: bool) -> Result<()> {
    let (paths, _) = open_project(root)?;
    let depths = QueueStore::new(paths.queues_dir).pipeline_depths()?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = depths
            .iter()
            .map(|(queue, depth)| (queue.to_string(), (*depth).into()))
            .collect();
        println!("{}", serde_json::Value::Object(map));
    } else {
        for (queue, depth) in depths {
            println!("{queue}\t{depth}");
        }
    }
    Ok(())
}

fn cmd_queue_push(
    root: &Path,
    queue: QueueName,
    id: &str,
    payload: &str,
    priority: Priority,
    created_by: &str,
) -> Result<()> {
    let (paths, _) = open_project(root)?;
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("parse payload as JSON")?;
    let entry = QueueEntry::new(queue, id, created_by, priority, payload);
    let path = QueueStore::new(paths.queues_dir).enqueue_atomic(queue, &entry)?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_health(root: &Path, json: bool) -> Result<()> {
    let (paths, cfg) = open_project(root)?;
    let manager = lifecycle(&paths, &cfg)?;
    let store = FileStateStore::new(paths.clone());
    let report = health::run_all(&paths, &cfg, &SystemTools, &manager, &store)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize health report")?
        );
    } else {
        print!("{}", render_report(&report));
    }
    report.into_result().map(|_| ())
}

fn cmd_queue_claim(root: &Path, queue: QueueName, consumer: &str) -> Result<()> {
    let (paths, _) = open_project(root)?;
    let claimed = QueueStore::new(paths.queues_dir).claim(queue, consumer)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&claimed).context("serialize claimed entry")?
    );
    Ok(())
}

fn cmd_queue_finish(
    root: &Path,
    queue: QueueName,
    file: &str,
    consumer: &str,
    failure: Option<&str>,
) -> Result<()> {
    let (paths, _) = open_project(root)?;
    let store = QueueStore::new(paths.queues_dir);
    let claimed = store.claimed(queue, consumer, file)?;
    let path = match failure {
        Some(reason) => store.fail(claimed, reason)?,
        None => store.complete(claimed)?,
    };
    println!("{}", path.display());
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    // Both handlers exist before this returns.
    let (mut interrupt, mut terminate) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::interrupt()).context("install SIGINT handler")?,
            signal(SignalKind::terminate()).context("install SIGTERM handler")?,
        )
    };
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let received = runtime.block_on(async {
                tokio::select! {
                    received = interrupt.recv() => received.map(|()| "SIGINT"),
                    received = terminate.recv() => received.map(|()| "SIGTERM"),
                }
            });
            match received {
                Some(name) => info!(signal = name, "interrupt received; stopping"),
                None => warn!("signal stream closed; stopping"),
            }
            cancel.cancel();
        })
        .context("spawn signal thread")?;
    Ok(())
}

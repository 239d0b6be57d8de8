//! Preflight health checks for `swarm health` and `swarm start`.
//!
//! Checks are grouped by category. `swarm start` runs the system and project
//! checks before touching the execution context, so a missing tool or
//! template fails the command instead of four loops.

use std::fmt;
use std::fmt::Write as _;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::types::{QueueName, WorkerKind, WorkerState};
use crate::io::config::SwarmConfig;
use crate::io::context::ContextProvider;
use crate::io::paths::SwarmPaths;
use crate::io::state_store::StateStore;
use crate::lifecycle::LifecycleManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    fn symbol(self) -> char {
        match self {
            CheckStatus::Pass => '+',
            CheckStatus::Warn => '!',
            CheckStatus::Fail => 'x',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckCategory {
    System,
    Project,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub category: CheckCategory,
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    fn new(
        name: &'static str,
        category: CheckCategory,
        status: CheckStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name,
            category,
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub results: Vec<CheckResult>,
}

impl HealthReport {
    pub fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// No check failed. Warnings do not block a start.
    pub fn is_healthy(&self) -> bool {
        self.count(CheckStatus::Fail) == 0
    }

    /// Turn failed checks into a [`PreflightError`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_healthy() {
            return Ok(self);
        }
        Err(PreflightError {
            failures: self
                .results
                .into_iter()
                .filter(|r| r.status == CheckStatus::Fail)
                .map(|r| format!("{}: {}", r.name, r.message))
                .collect(),
        }
        .into())
    }
}

/// One or more health checks failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightError {
    pub failures: Vec<String>,
}

impl fmt::Display for PreflightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "preflight failed: {}", self.failures.join("; "))
    }
}

impl std::error::Error for PreflightError {}

/// Looks up external tools.
pub trait ToolLocator {
    /// First line of `program <flag>`, or `None` when the program is not
    /// installed.
    fn version(&self, program: &str, flag: &str) -> Result<Option<String>>;
}

/// Runs the real binaries on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTools;

impl ToolLocator for SystemTools {
    fn version(&self, program: &str, flag: &str) -> Result<Option<String>> {
        let output = match Command::new(program).arg(flag).output() {
            Ok(output) => output,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("run {program} {flag}")),
        };
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        let text = String::from_utf8_lossy(&text);
        let line = text.lines().next().unwrap_or("").trim();
        Ok(Some(if line.is_empty() {
            program.to_string()
        } else {
            line.to_string()
        }))
    }
}

/// System and project checks: everything `swarm start` needs before it
/// creates the context.
#[instrument(skip_all)]
pub fn preflight<T: ToolLocator>(
    paths: &SwarmPaths,
    cfg: &SwarmConfig,
    tools: &T,
) -> Result<HealthReport> {
    let runtime = cfg.runtime.command.first().map_or("claude", String::as_str);
    let results = vec![
        check_tool(tools, "tmux", "tmux", "-V")?,
        check_tool(tools, "agent-runtime", runtime, "--version")?,
        check_prompts(paths),
        check_queue_dirs(paths),
    ];
    debug!(checks = results.len(), "preflight done");
    Ok(HealthReport { results })
}

/// Preflight plus the runtime check for a context with no live loops.
pub fn run_all<T, P, S>(
    paths: &SwarmPaths,
    cfg: &SwarmConfig,
    tools: &T,
    manager: &LifecycleManager<P>,
    store: &S,
) -> Result<HealthReport>
where
    T: ToolLocator,
    P: ContextProvider,
    S: StateStore,
{
    let mut report = preflight(paths, cfg, tools)?;
    report.results.push(check_stale_context(manager, store)?);
    Ok(report)
}

fn check_tool<T: ToolLocator>(
    tools: &T,
    name: &'static str,
    program: &str,
    flag: &str,
) -> Result<CheckResult> {
    Ok(match tools.version(program, flag)? {
        Some(version) => CheckResult::new(name, CheckCategory::System, CheckStatus::Pass, version),
        None => CheckResult::new(
            name,
            CheckCategory::System,
            CheckStatus::Fail,
            format!("{program} not found on PATH"),
        ),
    })
}

/// Every slot needs its template; one missing template fails.
fn check_prompts(paths: &SwarmPaths) -> CheckResult {
    let missing: Vec<String> = WorkerKind::ALL
        .into_iter()
        .map(|kind| paths.template_path(kind))
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
    if missing.is_empty() {
        CheckResult::new(
            "worker-prompts",
            CheckCategory::Project,
            CheckStatus::Pass,
            format!("all {} prompts found", WorkerKind::ALL.len()),
        )
    } else {
        CheckResult::new(
            "worker-prompts",
            CheckCategory::Project,
            CheckStatus::Fail,
            format!("missing: {}", missing.join(", ")),
        )
    }
}

/// Queue dirs are recreated on first push, so only a fully missing set fails.
fn check_queue_dirs(paths: &SwarmPaths) -> CheckResult {
    let missing: Vec<&str> = QueueName::ALL
        .into_iter()
        .filter(|queue| !paths.queue_dir(*queue).is_dir())
        .map(QueueName::as_str)
        .collect();
    let status = match missing.len() {
        0 => CheckStatus::Pass,
        n if n == QueueName::ALL.len() => CheckStatus::Fail,
        _ => CheckStatus::Warn,
    };
    let message = if missing.is_empty() {
        format!("all {} queue dirs present", QueueName::ALL.len())
    } else {
        format!("missing: {}", missing.join(", "))
    };
    CheckResult::new("queue-dirs", CheckCategory::Project, status, message)
}

/// A context whose loops all stopped is stale and blocks `swarm start`.
fn check_stale_context<P, S>(manager: &LifecycleManager<P>, store: &S) -> Result<CheckResult>
where
    P: ContextProvider,
    S: StateStore,
{
    let name = manager.provider().name().to_string();
    if !manager.provider().context_exists()? {
        return Ok(CheckResult::new(
            "stale-context",
            CheckCategory::Runtime,
            CheckStatus::Pass,
            format!("no context '{name}'"),
        ));
    }
    manager.sync_heartbeats(store)?;
    let slots = manager.worker_states()?;
    let live = slots.iter().filter(|slot| slot.is_active()).count();
    let errored = slots
        .iter()
        .filter(|slot| slot.state == WorkerState::Error)
        .count();
    Ok(if live == 0 {
        CheckResult::new(
            "stale-context",
            CheckCategory::Runtime,
            CheckStatus::Warn,
            format!("context '{name}' exists but no worker is running (run `swarm stop`)"),
        )
    } else {
        let mut message = format!("context '{name}' active with {live} worker(s)");
        if errored > 0 {
            let _ = write!(message, ", {errored} in error");
        }
        CheckResult::new("stale-context", CheckCategory::Runtime, CheckStatus::Pass, message)
    })
}

/// Plain-text report for terminals.
pub fn render_report(report: &HealthReport) -> String {
    let mut out = String::new();
    for result in &report.results {
        let _ = writeln!(
            out,
            "{} {:<15} {}",
            result.status.symbol(),
            result.name,
            result.message
        );
    }
    let _ = writeln!(
        out,
        "{}/{} passed, {} warning(s), {} failed",
        report.count(CheckStatus::Pass),
        report.results.len(),
        report.count(CheckStatus::Warn),
        report.count(CheckStatus::Fail)
    );
    out
}

//! Project layout and `swarm init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{SwarmConfig, write_config};
use crate::core::types::{QueueName, WorkerKind};

const RESEARCHER_TEMPLATE: &str = include_str!("prompts/researcher.md");
const CONVERTER_TEMPLATE: &str = include_str!("prompts/converter.md");
const BACKTESTER_TEMPLATE: &str = include_str!("prompts/backtester.md");
const OPTIMIZER_TEMPLATE: &str = include_str!("prompts/optimizer.md");

const WHAT_WORKS_PLACEHOLDER: &str = "# What works\n\n";
const WHAT_FAILS_PLACEHOLDER: &str = "# What fails\n\n";
const SWARM_GITIGNORE: &str = "logs/\nstatus/\n";

/// Built-in prompt template for a worker kind.
pub fn default_template(kind: WorkerKind) -> &'static str {
    match kind {
        WorkerKind::Researcher => RESEARCHER_TEMPLATE,
        WorkerKind::Converter => CONVERTER_TEMPLATE,
        WorkerKind::Backtester => BACKTESTER_TEMPLATE,
        WorkerKind::Optimizer => OPTIMIZER_TEMPLATE,
    }
}

/// All canonical paths for a project root.
#[derive(Debug, Clone)]
pub struct SwarmPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub swarm_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub status_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub failure_log_path: PathBuf,
    pub queues_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub patterns_dir: PathBuf,
    pub what_works_path: PathBuf,
    pub what_fails_path: PathBuf,
    pub output_dir: PathBuf,
}

impl SwarmPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let swarm_dir = root.join(".swarm");
        let patterns_dir = root.join("patterns");
        Self {
            config_path: root.join("swarm.toml"),
            checkpoints_dir: swarm_dir.join("checkpoints"),
            status_dir: swarm_dir.join("status"),
            sessions_dir: swarm_dir.join("sessions"),
            logs_dir: swarm_dir.join("logs"),
            failure_log_path: swarm_dir.join("failures.jsonl"),
            queues_dir: root.join("queues"),
            prompts_dir: root.join("prompts"),
            what_works_path: patterns_dir.join("what-works.md"),
            what_fails_path: patterns_dir.join("what-fails.md"),
            patterns_dir,
            output_dir: root.join("output"),
            swarm_dir,
            root,
        }
    }

    pub fn checkpoint_path(&self, slot: u32) -> PathBuf {
        self.checkpoints_dir.join(format!("slot-{slot}.json"))
    }

    pub fn status_path(&self, slot: u32) -> PathBuf {
        self.status_dir.join(format!("slot-{slot}.json"))
    }

    pub fn session_log_path(&self, slot: u32) -> PathBuf {
        self.sessions_dir.join(format!("slot-{slot}.jsonl"))
    }

    pub fn session_output_path(&self, slot: u32, session: u64) -> PathBuf {
        self.logs_dir
            .join(format!("slot-{slot}"))
            .join(format!("session-{session}.log"))
    }

    pub fn queue_dir(&self, queue: QueueName) -> PathBuf {
        self.queues_dir.join(queue.as_str())
    }

    pub fn template_path(&self, kind: WorkerKind) -> PathBuf {
        self.prompts_dir.join(format!("{}.md", kind.as_str()))
    }

    /// Artifact roots for `kind`: the configured dirs resolved against the
    /// project root, plus the queues `kind` produces into. The queues root
    /// itself is never scanned whole, so other slots' hand-offs do not count.
    pub fn artifact_roots(&self, dirs: &[String], kind: WorkerKind) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = dirs
            .iter()
            .map(|dir| self.root.join(dir))
            .filter(|root| *root != self.queues_dir)
            .collect();
        for queue in kind.produces() {
            let dir = self.queue_dir(*queue);
            if !roots.contains(&dir) {
                roots.push(dir);
            }
        }
        roots
    }
}

/// Options for `init_layout`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing swarm-owned files.
    pub force: bool,
}

/// Create the swarm layout in `root`.
///
/// Fails if `.swarm/` already exists unless `options.force` is set. Pattern
/// logs are never overwritten since workers append to them.
pub fn init_layout(root: &Path, options: &InitOptions) -> Result<SwarmPaths> {
    let paths = SwarmPaths::new(root);
    if paths.swarm_dir.exists() && !options.force {
        return Err(anyhow!(
            "swarm init: .swarm already exists (use --force to overwrite)"
        ));
    }
    if paths.swarm_dir.exists() && !paths.swarm_dir.is_dir() {
        return Err(anyhow!("swarm init: .swarm exists but is not a directory"));
    }

    for dir in [
        &paths.checkpoints_dir,
        &paths.status_dir,
        &paths.sessions_dir,
        &paths.logs_dir,
        &paths.prompts_dir,
        &paths.patterns_dir,
        &paths.output_dir,
    ] {
        create_dir(dir)?;
    }
    for queue in QueueName::ALL {
        create_dir(&paths.queue_dir(queue))?;
    }

    write_file(&paths.swarm_dir.join(".gitignore"), SWARM_GITIGNORE)?;
    for kind in WorkerKind::ALL {
        write_file(&paths.template_path(kind), default_template(kind))?;
    }
    write_if_missing(&paths.what_works_path, WHAT_WORKS_PLACEHOLDER)?;
    write_if_missing(&paths.what_fails_path, WHAT_FAILS_PLACEHOLDER)?;
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &SwarmConfig::default())?;
    }

    info!(root = %paths.root.display(), "swarm layout initialized");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

fn write_if_missing(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_file(path, contents)
}

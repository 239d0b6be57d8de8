//! Swarm configuration stored in `swarm.toml` at the project root.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::budget::BudgetPolicy;
use crate::core::recovery::TimeoutBudget;
use crate::core::types::Mode;

/// Swarm configuration (TOML).
///
/// Edited by humans. Missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SwarmConfig {
    pub modes: ModesConfig,
    pub budget: BudgetConfig,
    pub mission: MissionConfig,
    pub runtime: RuntimeConfig,
    pub context: ContextConfig,
    /// Free-form strategy profile parameters exposed to prompts.
    pub profile: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModesConfig {
    pub research: ModeConfig,
    pub production: ModeConfig,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            research: ModeConfig {
                session_timeout_secs: 30 * 60,
                budget_cap_usd: 50.0,
            },
            production: ModeConfig {
                session_timeout_secs: 60 * 60,
                budget_cap_usd: 100.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeConfig {
    pub session_timeout_secs: u64,
    pub budget_cap_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Heuristic: how many sessions one dollar buys.
    pub sessions_per_dollar: f64,
    pub input_per_1k_usd: f64,
    pub output_per_1k_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            sessions_per_dollar: 24.0,
            input_per_1k_usd: 0.003,
            output_per_1k_usd: 0.015,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MissionConfig {
    pub cooldown_secs: u64,
    pub timeout_increment_secs: u64,
    /// Timeout cap as a multiple of the mode's base timeout.
    pub timeout_cap_factor: u32,
    /// Stop after this many iterations; 0 runs until budget or interrupt.
    pub max_iterations: u64,
    pub completion_marker: String,
    /// Captured output kept in memory per session.
    pub output_limit_bytes: usize,
    /// Lines of prior logs fed back into the prompt.
    pub log_tail_lines: usize,
    /// Maximum bytes for the prompt before droppable sections are removed.
    pub prompt_budget_bytes: usize,
    /// Time between SIGINT and SIGKILL when a session is interrupted.
    pub interrupt_grace_secs: u64,
    /// Consecutive failures before an extra pause; 0 disables.
    pub max_consecutive_failures: u32,
    pub consecutive_failure_pause_secs: u64,
    /// Directories (relative to the project root) scanned for new artifacts.
    /// The queues a worker produces into are always scanned as well.
    pub artifact_dirs: Vec<String>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            timeout_increment_secs: 10 * 60,
            timeout_cap_factor: 2,
            max_iterations: 0,
            completion_marker: "SESSION_COMPLETE".to_string(),
            output_limit_bytes: 200_000,
            log_tail_lines: 40,
            prompt_budget_bytes: 40_000,
            interrupt_grace_secs: 10,
            max_consecutive_failures: 0,
            consecutive_failure_pause_secs: 5 * 60,
            artifact_dirs: vec!["output".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Agent runtime argv; the prompt is written to stdin.
    pub command: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                "--dangerously-skip-permissions",
                "--output-format",
                "text",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    /// Name of the tmux session hosting the worker panes.
    pub session_name: String,
    pub stop_grace_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            session_name: "swarm".to_string(),
            stop_grace_secs: 10,
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<()> {
        for (mode, cfg) in [
            (Mode::Research, &self.modes.research),
            (Mode::Production, &self.modes.production),
        ] {
            if cfg.session_timeout_secs == 0 {
                return Err(anyhow!("modes.{mode}.session_timeout_secs must be > 0"));
            }
            if !(cfg.budget_cap_usd.is_finite() && cfg.budget_cap_usd > 0.0) {
                return Err(anyhow!("modes.{mode}.budget_cap_usd must be > 0"));
            }
        }
        if !(self.budget.sessions_per_dollar.is_finite() && self.budget.sessions_per_dollar > 0.0) {
            return Err(anyhow!("budget.sessions_per_dollar must be > 0"));
        }
        if self.budget.input_per_1k_usd < 0.0 || self.budget.output_per_1k_usd < 0.0 {
            return Err(anyhow!("budget token prices must be >= 0"));
        }
        if self.mission.timeout_cap_factor == 0 {
            return Err(anyhow!("mission.timeout_cap_factor must be >= 1"));
        }
        if self.mission.completion_marker.trim().is_empty() {
            return Err(anyhow!("mission.completion_marker must be non-empty"));
        }
        if self.mission.output_limit_bytes == 0 {
            return Err(anyhow!("mission.output_limit_bytes must be > 0"));
        }
        if self.mission.prompt_budget_bytes == 0 {
            return Err(anyhow!("mission.prompt_budget_bytes must be > 0"));
        }
        if self.mission.artifact_dirs.is_empty() {
            return Err(anyhow!("mission.artifact_dirs must list at least one directory"));
        }
        if self.runtime.command.is_empty() || self.runtime.command[0].trim().is_empty() {
            return Err(anyhow!("runtime.command must be a non-empty array"));
        }
        if self.context.session_name.trim().is_empty() {
            return Err(anyhow!("context.session_name must be non-empty"));
        }
        Ok(())
    }

    pub fn mode(&self, mode: Mode) -> &ModeConfig {
        match mode {
            Mode::Research => &self.modes.research,
            Mode::Production => &self.modes.production,
        }
    }

    pub fn budget_policy(&self, mode: Mode) -> BudgetPolicy {
        BudgetPolicy {
            cap_usd: self.mode(mode).budget_cap_usd,
            sessions_per_dollar: self.budget.sessions_per_dollar,
            input_per_1k_usd: self.budget.input_per_1k_usd,
            output_per_1k_usd: self.budget.output_per_1k_usd,
        }
    }

    pub fn timeout_budget(&self, mode: Mode) -> TimeoutBudget {
        let base = Duration::from_secs(self.mode(mode).session_timeout_secs);
        TimeoutBudget::new(
            base,
            Duration::from_secs(self.mission.timeout_increment_secs),
            base * self.mission.timeout_cap_factor,
        )
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SwarmConfig::default()`.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing; using defaults");
        let cfg = SwarmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SwarmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SwarmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::fs_util::write_atomic(path, buf.as_bytes())
}

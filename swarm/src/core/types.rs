//! Shared deterministic types for swarm core logic.
//!
//! These types define stable contracts between core components and the
//! on-disk formats. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// The four pipeline stages a slot can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Researcher,
    Converter,
    Backtester,
    Optimizer,
}

impl WorkerKind {
    /// All kinds in pipeline order.
    pub const ALL: [WorkerKind; 4] = [
        WorkerKind::Researcher,
        WorkerKind::Converter,
        WorkerKind::Backtester,
        WorkerKind::Optimizer,
    ];

    /// Fixed slot position inside the execution context grid.
    pub fn slot(self) -> u32 {
        match self {
            WorkerKind::Researcher => 0,
            WorkerKind::Converter => 1,
            WorkerKind::Backtester => 2,
            WorkerKind::Optimizer => 3,
        }
    }

    pub fn from_slot(slot: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slot() == slot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Researcher => "researcher",
            WorkerKind::Converter => "converter",
            WorkerKind::Backtester => "backtester",
            WorkerKind::Optimizer => "optimizer",
        }
    }

    /// Queues this kind reads work from.
    pub fn consumes(self) -> &'static [QueueName] {
        match self {
            WorkerKind::Researcher => &[],
            WorkerKind::Converter => &[QueueName::Hypotheses, QueueName::ToConvert],
            WorkerKind::Backtester => &[QueueName::ToBacktest],
            WorkerKind::Optimizer => &[QueueName::ToOptimize],
        }
    }

    /// Queues this kind hands work off to.
    pub fn produces(self) -> &'static [QueueName] {
        match self {
            WorkerKind::Researcher => &[QueueName::Hypotheses, QueueName::ToConvert],
            WorkerKind::Converter => &[QueueName::ToBacktest],
            WorkerKind::Backtester => &[QueueName::ToOptimize],
            WorkerKind::Optimizer => &[],
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                anyhow!("unknown worker '{s}' (expected researcher|converter|backtester|optimizer)")
            })
    }
}

/// Lifecycle state of a worker slot as seen by the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Idle,
    Stopping,
    Error,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Idle => "idle",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational mode; selects the session timeout and budget cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Research,
    Production,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Research => "research",
            Mode::Production => "production",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" => Ok(Mode::Research),
            "production" => Ok(Mode::Production),
            other => Err(anyhow!("unknown mode '{other}' (expected research|production)")),
        }
    }
}

/// Pipeline hand-off queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "hypotheses")]
    Hypotheses,
    #[serde(rename = "to-convert")]
    ToConvert,
    #[serde(rename = "to-backtest")]
    ToBacktest,
    #[serde(rename = "to-optimize")]
    ToOptimize,
}

impl QueueName {
    /// All queues in pipeline order.
    pub const ALL: [QueueName; 4] = [
        QueueName::Hypotheses,
        QueueName::ToConvert,
        QueueName::ToBacktest,
        QueueName::ToOptimize,
    ];

    /// Directory name under the queues root.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Hypotheses => "hypotheses",
            QueueName::ToConvert => "to-convert",
            QueueName::ToBacktest => "to-backtest",
            QueueName::ToOptimize => "to-optimize",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|queue| queue.as_str() == s.trim())
            .ok_or_else(|| {
                anyhow!("unknown queue '{s}' (expected hypotheses|to-convert|to-backtest|to-optimize)")
            })
    }
}

/// Failure taxonomy. Every kind is recovered inside the mission loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimit,
    MissingData,
    DependencyError,
    DomainLogicError,
    NetworkError,
    NoOutput,
    NoTrades,
    InvalidOutput,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::MissingData => "missing_data",
            FailureKind::DependencyError => "dependency_error",
            FailureKind::DomainLogicError => "domain_logic_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::NoOutput => "no_output",
            FailureKind::NoTrades => "no_trades",
            FailureKind::InvalidOutput => "invalid_output",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one mission session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    /// The session produced at least one accepted artifact.
    Valid,
    /// The session ran but did not produce acceptable work.
    Failed,
}

/// Lifecycle status persisted in a slot checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    #[default]
    Running,
    Interrupted,
    Complete,
}

//! Artifact validation for one mission session.
//!
//! Decides whether an invocation produced legitimate work independently of
//! what the agent printed about itself. Pure: the same output and file
//! snapshot always yield the same report.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::core::types::FailureKind;

/// Keys that carry a trade count in backtest-shaped results.
const TRADE_COUNT_KEYS: &[&str] = &[
    "trades",
    "total_trades",
    "num_trades",
    "trade_count",
    "n_trades",
    "totalTrades",
    "numTrades",
    "tradeCount",
];

/// Substructures that may hold per-sample metrics.
const NESTED_KEYS: &[&str] = &[
    "in_sample",
    "out_of_sample",
    "inSample",
    "outOfSample",
    "is",
    "oos",
    "metrics",
    "results",
    "summary",
];

/// Arrays of per-window results (walk-forward folds).
const WINDOW_KEYS: &[&str] = &["folds", "windows", "splits"];

/// A file created during the session, as seen by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub path: PathBuf,
    /// Contents for structured (`.json`) files; `None` for everything else.
    pub contents: Option<String>,
}

impl ArtifactFile {
    pub fn structured(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: Some(contents.into()),
        }
    }

    pub fn opaque(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            contents: None,
        }
    }
}

/// Per-file decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactVerdict {
    pub path: PathBuf,
    pub rejection: Option<FailureKind>,
    pub trade_count: Option<u64>,
}

impl ArtifactVerdict {
    pub fn accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Result of validating one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub marker_present: bool,
    pub verdicts: Vec<ArtifactVerdict>,
    /// Set when the session must not count as progress.
    pub failure: Option<FailureKind>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }

    /// Number of artifacts that passed acceptance.
    pub fn accepted(&self) -> usize {
        self.verdicts.iter().filter(|v| v.accepted()).count()
    }

    pub fn detail(&self) -> String {
        match self.failure {
            None => format!("{} artifact(s) accepted", self.accepted()),
            Some(kind) if !self.marker_present => format!("{kind}: completion marker missing"),
            Some(kind) if self.verdicts.is_empty() => format!("{kind}: no new files"),
            Some(kind) => {
                let rejected: Vec<String> = self
                    .verdicts
                    .iter()
                    .filter_map(|v| {
                        v.rejection
                            .map(|reason| format!("{} ({reason})", v.path.display()))
                    })
                    .collect();
                format!("{kind}: {}", rejected.join(", "))
            }
        }
    }
}

/// Validate captured output plus the files created during the session.
///
/// Artifacts are judged in path order so reports are stable.
pub fn validate_session(output: &str, marker: &str, artifacts: &[ArtifactFile]) -> ValidationReport {
    let marker_present = !marker.is_empty() && output.contains(marker);
    if !marker_present {
        return ValidationReport {
            marker_present,
            verdicts: Vec::new(),
            failure: Some(FailureKind::NoOutput),
        };
    }

    let mut sorted: Vec<&ArtifactFile> = artifacts.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    let verdicts: Vec<ArtifactVerdict> = sorted.into_iter().map(judge_artifact).collect();

    let failure = if verdicts.is_empty() {
        Some(FailureKind::NoOutput)
    } else if verdicts.iter().any(ArtifactVerdict::accepted) {
        None
    } else if verdicts
        .iter()
        .any(|v| v.rejection == Some(FailureKind::NoTrades))
    {
        Some(FailureKind::NoTrades)
    } else {
        Some(FailureKind::InvalidOutput)
    };

    ValidationReport {
        marker_present,
        verdicts,
        failure,
    }
}

fn judge_artifact(artifact: &ArtifactFile) -> ArtifactVerdict {
    let verdict = |rejection, trade_count| ArtifactVerdict {
        path: artifact.path.clone(),
        rejection,
        trade_count,
    };

    if !is_structured(&artifact.path) {
        return verdict(None, None);
    }
    let Some(contents) = artifact.contents.as_deref() else {
        return verdict(Some(FailureKind::InvalidOutput), None);
    };
    let Ok(value) = serde_json::from_str::<Value>(contents) else {
        return verdict(Some(FailureKind::InvalidOutput), None);
    };
    match trade_count(&value) {
        Some(0) => verdict(Some(FailureKind::NoTrades), Some(0)),
        Some(count) => verdict(None, Some(count)),
        // Hypotheses, configs and other non-backtest JSON.
        None => verdict(None, None),
    }
}

/// Structured result files are the only ones whose contents are inspected.
pub fn is_structured(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Extract a trade count from a backtest-shaped result, if it has one.
///
/// A top-level count wins. Otherwise counts found in sample substructures
/// (and in walk-forward windows) are summed.
pub fn trade_count(value: &Value) -> Option<u64> {
    let object = value.as_object()?;

    if let Some(count) = TRADE_COUNT_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(count_of))
    {
        return Some(count);
    }

    let mut found = false;
    let mut total = 0u64;
    for key in NESTED_KEYS {
        if let Some(count) = object.get(*key).and_then(trade_count) {
            found = true;
            total = total.saturating_add(count);
        }
    }
    for key in WINDOW_KEYS {
        if let Some(windows) = object.get(*key).and_then(Value::as_array) {
            for window in windows {
                if let Some(count) = trade_count(window) {
                    found = true;
                    total = total.saturating_add(count);
                }
            }
        }
    }
    found.then_some(total)
}

fn count_of(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64)),
        Value::Array(items) => Some(items.len() as u64),
        _ => None,
    }
}

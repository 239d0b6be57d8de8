//! Failure classification for unsuccessful sessions.
//!
//! Rules are evaluated in order and the first match wins. The default table
//! checks timeouts first, then output phrases, then the validator's verdict.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::recovery::RecoveryAction;
use crate::core::types::FailureKind;
use crate::core::validator::ValidationReport;

/// Exit codes conventionally produced by `timeout(1)` and SIGKILL.
const TIMEOUT_EXIT_CODES: &[i32] = &[124, 137];

/// Characters of output kept in a classification detail.
const DETAIL_TAIL_CHARS: usize = 400;

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate[ _-]?limit|\b429\b|too many requests|overloaded|quota exceeded")
        .expect("rate limit regex")
});

static MISSING_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bno data\b|data not found|FileNotFoundError|missing data")
        .expect("missing data regex")
});

static DEPENDENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ModuleNotFoundError|ImportError|No module named|command not found")
        .expect("dependency regex")
});

static DOMAIN_LOGIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ValueError|KeyError|IndexError|ZeroDivisionError|(?i:strategy error)")
        .expect("domain logic regex")
});

static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection refused|connection reset|timed out|network error|api error|\b50[23]\b",
    )
    .expect("network regex")
});

/// What one session looked like from the outside.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub output: &'a str,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub report: &'a ValidationReport,
}

impl Observation<'_> {
    /// Clean exit with at least one accepted artifact.
    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0) && self.report.is_valid()
    }
}

/// Predicate half of a rule.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Wall-clock timeout, or an exit code that signals one.
    TimedOut,
    /// Regex over the combined output.
    Output(Regex),
    /// Marker present but validation rejected the session with this kind.
    Validation(FailureKind),
}

impl Matcher {
    fn matches(&self, observation: &Observation<'_>) -> Option<String> {
        match self {
            Matcher::TimedOut => {
                let by_code = observation
                    .exit_code
                    .is_some_and(|code| TIMEOUT_EXIT_CODES.contains(&code));
                (observation.timed_out || by_code).then(|| match observation.exit_code {
                    Some(code) if !observation.timed_out => format!("exit code {code}"),
                    _ => "session exceeded its timeout".to_string(),
                })
            }
            Matcher::Output(regex) => regex
                .find(observation.output)
                .map(|found| format!("matched '{}'", found.as_str())),
            Matcher::Validation(kind) => {
                let report = observation.report;
                (report.marker_present && report.failure == Some(*kind)).then(|| report.detail())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureRule {
    pub matcher: Matcher,
    pub kind: FailureKind,
    pub action: RecoveryAction,
}

impl FailureRule {
    pub fn new(matcher: Matcher, kind: FailureKind, action: RecoveryAction) -> Self {
        Self {
            matcher,
            kind,
            action,
        }
    }
}

/// Result of classifying one failed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub kind: FailureKind,
    pub action: RecoveryAction,
    pub detail: String,
}

/// Ordered rule table.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<FailureRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl Classifier {
    pub fn new(rules: Vec<FailureRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FailureRule] {
        &self.rules
    }

    /// Classify a session. Returns `None` for successful sessions.
    pub fn classify(&self, observation: &Observation<'_>) -> Option<Classification> {
        if observation.is_success() {
            return None;
        }
        for rule in &self.rules {
            if let Some(detail) = rule.matcher.matches(observation) {
                return Some(Classification {
                    kind: rule.kind,
                    action: rule.action,
                    detail,
                });
            }
        }

        let kind = if !observation.report.marker_present && observation.exit_code == Some(0) {
            FailureKind::NoOutput
        } else {
            FailureKind::Unknown
        };
        let exit = observation
            .exit_code
            .map_or_else(|| "no exit code".to_string(), |code| format!("exit {code}"));
        Some(Classification {
            kind,
            action: RecoveryAction::Continue,
            detail: format!("{exit}: {}", tail_chars(observation.output, DETAIL_TAIL_CHARS)),
        })
    }
}

/// The built-in precedence: timeout, rate limit, missing data, dependency,
/// domain logic, network, then validator verdicts.
pub fn default_rules() -> Vec<FailureRule> {
    vec![
        FailureRule::new(
            Matcher::TimedOut,
            FailureKind::Timeout,
            RecoveryAction::ExtendTimeout,
        ),
        FailureRule::new(
            Matcher::Output(RATE_LIMIT_RE.clone()),
            FailureKind::RateLimit,
            RecoveryAction::rate_limit_backoff(),
        ),
        FailureRule::new(
            Matcher::Output(MISSING_DATA_RE.clone()),
            FailureKind::MissingData,
            RecoveryAction::Continue,
        ),
        FailureRule::new(
            Matcher::Output(DEPENDENCY_RE.clone()),
            FailureKind::DependencyError,
            RecoveryAction::Continue,
        ),
        FailureRule::new(
            Matcher::Output(DOMAIN_LOGIC_RE.clone()),
            FailureKind::DomainLogicError,
            RecoveryAction::Continue,
        ),
        FailureRule::new(
            Matcher::Output(NETWORK_RE.clone()),
            FailureKind::NetworkError,
            RecoveryAction::network_pause(),
        ),
        FailureRule::new(
            Matcher::Validation(FailureKind::NoOutput),
            FailureKind::NoOutput,
            RecoveryAction::Continue,
        ),
        FailureRule::new(
            Matcher::Validation(FailureKind::NoTrades),
            FailureKind::NoTrades,
            RecoveryAction::Continue,
        ),
        FailureRule::new(
            Matcher::Validation(FailureKind::InvalidOutput),
            FailureKind::InvalidOutput,
            RecoveryAction::Continue,
        ),
    ]
}

/// Last `max` characters of `text`, on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text.trim();
    }
    let skip = count - max;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(index, _)| index);
    text[start..].trim()
}

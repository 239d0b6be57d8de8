//! Mission prompt assembly from on-disk templates and live pipeline state.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::fs_util::tail_lines;
use super::paths::SwarmPaths;
use crate::core::types::{Mode, QueueName, WorkerKind};

/// Drop order when the rendered prompt exceeds its byte budget.
const DROP_ORDER: &[&str] = &["works", "fails", "previous", "profile"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// The slot's prompt template does not exist. Fatal for the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTemplateError {
    pub kind: WorkerKind,
    pub path: PathBuf,
}

impl fmt::Display for MissingTemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prompt template for {} not found at {}",
            self.kind,
            self.path.display()
        )
    }
}

impl std::error::Error for MissingTemplateError {}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub name: String,
    pub depth: usize,
}

/// Everything a template can interpolate.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub kind: WorkerKind,
    pub slot: u32,
    pub mode: Mode,
    pub session_number: u64,
    pub marker: String,
    pub output_dir: String,
    /// Shell prefix for `swarm queue` subcommands, e.g. `swarm -C /p queue`.
    pub queue_command: String,
    pub consumes: Vec<String>,
    pub produces: Vec<String>,
    pub queue_depths: Vec<QueueDepth>,
    pub profile: BTreeMap<String, String>,
    pub previous_session: String,
    pub what_works: String,
    pub what_fails: String,
}

/// Per-slot facts the loop already knows.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub kind: WorkerKind,
    pub mode: Mode,
    pub session_number: u64,
    pub marker: &'a str,
    pub queue_command: &'a str,
    pub profile: &'a BTreeMap<String, String>,
    pub queue_depths: &'a [(QueueName, usize)],
    pub tail_lines: usize,
}

impl PromptContext {
    /// Gather live context: previous session output and pattern log tails.
    pub fn gather(paths: &SwarmPaths, request: &PromptRequest<'_>) -> Result<Self> {
        let slot = request.kind.slot();
        let previous_session = match request.session_number.checked_sub(1) {
            Some(previous) if previous > 0 => tail_lines(
                &paths.session_output_path(slot, previous),
                request.tail_lines,
            )?,
            _ => String::new(),
        };
        let names = |queues: &[QueueName]| queues.iter().map(|q| q.to_string()).collect();
        Ok(Self {
            kind: request.kind,
            slot,
            mode: request.mode,
            session_number: request.session_number,
            marker: request.marker.to_string(),
            output_dir: paths
                .output_dir
                .strip_prefix(&paths.root)
                .unwrap_or(&paths.output_dir)
                .display()
                .to_string(),
            queue_command: request.queue_command.to_string(),
            consumes: names(request.kind.consumes()),
            produces: names(request.kind.produces()),
            queue_depths: request
                .queue_depths
                .iter()
                .map(|(queue, depth)| QueueDepth {
                    name: queue.to_string(),
                    depth: *depth,
                })
                .collect(),
            profile: request.profile.clone(),
            previous_session: previous_session.trim().to_string(),
            what_works: tail_lines(&paths.what_works_path, request.tail_lines)?
                .trim()
                .to_string(),
            what_fails: tail_lines(&paths.what_fails_path, request.tail_lines)?
                .trim()
                .to_string(),
        })
    }
}

/// Renders `prompts/<kind>.md` within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, paths: &SwarmPaths, context: &PromptContext) -> Result<String> {
        let path = paths.template_path(context.kind);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MissingTemplateError {
                    kind: context.kind,
                    path,
                }
                .into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read template {}", path.display()));
            }
        };
        self.render(&source, context)
            .with_context(|| format!("render template {}", path.display()))
    }

    pub fn render(&self, source: &str, context: &PromptContext) -> Result<String> {
        let rendered = Environment::new().render_str(source, context)?;
        let mut sections = parse_sections(&rendered);
        if sections.is_empty() {
            // Templates without section markers are used as-is.
            return Ok(rendered.trim().to_string());
        }
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (index, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::paths::{InitOptions, default_template, init_layout};

    fn context(kind: WorkerKind) -> PromptContext {
        PromptContext {
            kind,
            slot: kind.slot(),
            mode: Mode::Research,
            session_number: 3,
            marker: "SESSION_COMPLETE".to_string(),
            output_dir: "output".to_string(),
            queue_command: "swarm queue".to_string(),
            consumes: kind.consumes().iter().map(|q| q.to_string()).collect(),
            produces: kind.produces().iter().map(|q| q.to_string()).collect(),
            queue_depths: vec![QueueDepth {
                name: "to-backtest".to_string(),
                depth: 4,
            }],
            profile: BTreeMap::from([("market".to_string(), "ES".to_string())]),
            previous_session: "previous output".to_string(),
            what_works: "ORB".to_string(),
            what_fails: "mean reversion on trend days".to_string(),
        }
    }

    /// Verifies the default template interpolates live context in a stable order.
    #[test]
    fn default_template_renders_live_context() {
        let prompt = PromptBuilder::new(50_000)
            .render(
                default_template(WorkerKind::Backtester),
                &context(WorkerKind::Backtester),
            )
            .expect("render");

        assert!(prompt.contains("backtester worker (slot 2) in research mode, session 3"));
        assert!(prompt.contains("- to-backtest: 4 pending"));
        assert!(prompt.contains("Read work from: to-backtest"));
        assert!(prompt.contains("`swarm queue claim <queue> --consumer backtester`"));
        assert!(prompt.contains(
            "`swarm queue push <queue> <id> '<payload-json>' --created-by backtester`"
        ));
        assert!(!prompt.contains("rename it into"));
        assert!(prompt.contains("- market: ES"));
        assert!(prompt.contains("`SESSION_COMPLETE`"));
        let contract = prompt.find("### Backtester Contract").expect("contract");
        let queues = prompt.find("### Queues").expect("queues");
        let previous = prompt.find("### Previous Session").expect("previous");
        assert!(contract < queues && queues < previous);
    }

    /// Verifies pattern tails are dropped before required sections.
    #[test]
    fn budget_drops_pattern_sections_first() {
        let mut ctx = context(WorkerKind::Researcher);
        ctx.what_works = "works ".repeat(500);
        ctx.what_fails = "fails ".repeat(500);
        let prompt = PromptBuilder::new(1_500)
            .render(default_template(WorkerKind::Researcher), &ctx)
            .expect("render");
        assert!(!prompt.contains("### What Works"));
        assert!(!prompt.contains("### What Fails"));
        assert!(prompt.contains("### Researcher Contract"));
        assert!(prompt.contains("### Queues"));
    }

    /// Verifies a missing template surfaces as a typed error.
    #[test]
    fn missing_template_is_typed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SwarmPaths::new(temp.path());
        let err = PromptBuilder::new(10_000)
            .build(&paths, &context(WorkerKind::Optimizer))
            .expect_err("missing template");
        let missing = err
            .downcast_ref::<MissingTemplateError>()
            .expect("typed error");
        assert_eq!(missing.kind, WorkerKind::Optimizer);
    }

    /// Verifies gathered context reads the previous session log tail.
    #[test]
    fn gather_reads_previous_session_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_layout(temp.path(), &InitOptions { force: false }).expect("init");
        let log = paths.session_output_path(WorkerKind::Converter.slot(), 4);
        fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
        fs::write(&log, "line1\nline2\nline3\n").expect("write log");

        let profile = BTreeMap::new();
        let request = PromptRequest {
            kind: WorkerKind::Converter,
            mode: Mode::Production,
            session_number: 5,
            marker: "SESSION_COMPLETE",
            queue_command: "/opt/bin/swarm -C /p queue",
            profile: &profile,
            queue_depths: &[(QueueName::Hypotheses, 2)],
            tail_lines: 2,
        };
        let ctx = PromptContext::gather(&paths, &request).expect("gather");
        assert_eq!(ctx.previous_session, "line2\nline3");
        assert_eq!(ctx.output_dir, "output");
        assert_eq!(ctx.consumes, vec!["hypotheses", "to-convert"]);
        assert_eq!(ctx.queue_command, "/opt/bin/swarm -C /p queue");

        let prompt = PromptBuilder::new(10_000).build(&paths, &ctx).expect("build");
        assert!(prompt.contains("- hypotheses: 2 pending"));
    }
}

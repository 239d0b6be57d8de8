//! Agent runtime abstraction for mission sessions.
//!
//! The [`AgentRuntime`] trait decouples the mission loop from the actual agent
//! backend (by default the `claude` CLI). Tests use scripted runtimes that
//! return predetermined output without spawning processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::process::SupervisedChild;

static INPUT_TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?(?:input[_ ]tokens|tokens[_ ]in)"?\s*[:=]\s*(\d+)"#)
        .expect("input tokens regex")
});

static OUTPUT_TOKENS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"?(?:output[_ ]tokens|tokens[_ ]out)"?\s*[:=]\s*(\d+)"#)
        .expect("output tokens regex")
});

/// The runtime binary is not installed. Fatal: retrying cannot help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeBinaryMissing {
    pub binary: String,
}

impl fmt::Display for RuntimeBinaryMissing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent runtime binary '{}' not found on PATH", self.binary)
    }
}

impl std::error::Error for RuntimeBinaryMissing {}

/// Parameters for one invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub timeout: Duration,
    /// Captured output kept in memory.
    pub output_limit_bytes: usize,
    /// Full output is streamed here as it arrives.
    pub log_path: PathBuf,
    /// Time allowed between SIGINT and SIGKILL on interrupt.
    pub interrupt_grace: Duration,
}

/// What one invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub interrupted: bool,
    pub elapsed: Duration,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Abstraction over agent execution backends.
pub trait AgentRuntime {
    /// Run one session. Nonzero exits and timeouts are reported in the
    /// returned [`Invocation`]; only infrastructure failures are errors.
    fn invoke(&self, request: &InvocationRequest, cancel: &CancelToken) -> Result<Invocation>;
}

/// Runtime that spawns a configured command and writes the prompt to stdin.
#[derive(Debug, Clone)]
pub struct ClaudeRuntime {
    command: Vec<String>,
}

impl ClaudeRuntime {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("runtime command must be non-empty"));
        }
        Ok(Self { command })
    }

    fn program(&self) -> &str {
        &self.command[0]
    }
}

impl AgentRuntime for ClaudeRuntime {
    #[instrument(skip_all, fields(program = self.program(), timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &InvocationRequest, cancel: &CancelToken) -> Result<Invocation> {
        info!(workdir = %request.workdir.display(), "starting agent runtime");

        let mut cmd = Command::new(self.program());
        cmd.args(&self.command[1..]).current_dir(&request.workdir);

        let child = match SupervisedChild::spawn(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            request.output_limit_bytes,
            Some(&request.log_path),
        ) {
            Ok(child) => child,
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                return Err(RuntimeBinaryMissing {
                    binary: self.program().to_string(),
                }
                .into());
            }
            Err(err) => return Err(err).context("start agent runtime"),
        };

        let output = child.wait(request.timeout, cancel, request.interrupt_grace)?;
        let text = output.text();
        let (tokens_in, tokens_out) = parse_token_usage(&text);
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent runtime timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.exit_code(), "agent runtime exited nonzero");
        }
        debug!(tokens_in, tokens_out, bytes = text.len(), "agent runtime finished");

        Ok(Invocation {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            interrupted: output.interrupted,
            elapsed: output.elapsed,
            output: text,
            tokens_in,
            tokens_out,
        })
    }
}

/// Token usage reported in the output, if any. The last report wins.
pub fn parse_token_usage(output: &str) -> (u64, u64) {
    let last = |re: &Regex| {
        re.captures_iter(output)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            .last()
            .unwrap_or(0)
    };
    (last(&INPUT_TOKENS_RE), last(&OUTPUT_TOKENS_RE))
}

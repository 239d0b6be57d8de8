//! Execution-context provider: where worker loops are hosted.
//!
//! The lifecycle manager only needs to create a context with one slot per
//! worker, type a command into a slot, interrupt it, and tear everything
//! down. [`TmuxProvider`] does that with a detached tmux session whose panes
//! are the slots.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// `start_all` found a context already running. The existing one is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextExistsError {
    pub name: String,
}

impl fmt::Display for ContextExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution context '{}' already exists", self.name)
    }
}

impl std::error::Error for ContextExistsError {}

/// An operation needed a running context and there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextMissingError {
    pub name: String,
}

impl fmt::Display for ContextMissingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "execution context '{}' is not running (run `swarm start` first)",
            self.name
        )
    }
}

impl std::error::Error for ContextMissingError {}

/// Abstraction over whatever hosts the worker loops.
pub trait ContextProvider {
    /// Human-readable context name used in errors and logs.
    fn name(&self) -> &str;
    fn context_exists(&self) -> Result<bool>;
    fn create_context(&self) -> Result<()>;
    /// Lay out `slots` addressable slots (0-based) inside the context.
    fn create_grid(&self, slots: u32) -> Result<()>;
    /// Type `text` into a slot and submit it.
    fn send_input(&self, slot: u32, text: &str) -> Result<()>;
    /// Deliver an interrupt (Ctrl-C) to whatever runs in the slot.
    fn interrupt(&self, slot: u32) -> Result<()>;
    fn destroy_context(&self) -> Result<()>;
    /// Stable reference to a slot for display.
    fn slot_ref(&self, slot: u32) -> String {
        format!("{}:{slot}", self.name())
    }
}

/// Wrapper for driving a tmux session.
#[derive(Debug, Clone)]
pub struct TmuxProvider {
    session: String,
    workdir: PathBuf,
}

impl TmuxProvider {
    pub fn new(session: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            session: session.into(),
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve a slot to a pane id. Slots follow pane order, so this works
    /// regardless of the user's `base-index` settings.
    fn pane_target(&self, slot: u32) -> Result<String> {
        let out = self.run_capture(&[
            "list-panes",
            "-t",
            &self.session,
            "-F",
            "#{pane_index} #{pane_id}",
        ])?;
        let panes = parse_pane_list(&out);
        panes
            .get(slot as usize)
            .cloned()
            .ok_or_else(|| anyhow!("tmux session {} has no pane for slot {slot}", self.session))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tmux {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("tmux")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn tmux {}", args.join(" ")))
    }
}

impl ContextProvider for TmuxProvider {
    fn name(&self) -> &str {
        &self.session
    }

    /// Without a tmux binary there is no session to find.
    fn context_exists(&self) -> Result<bool> {
        match self.run(&["has-session", "-t", &self.session]) {
            Ok(output) => Ok(output.status.success()),
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                debug!("tmux not installed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(session = %self.session))]
    fn create_context(&self) -> Result<()> {
        let workdir = self.workdir.display().to_string();
        self.run_checked(&["new-session", "-d", "-s", &self.session, "-c", &workdir])?;
        debug!("tmux session created");
        Ok(())
    }

    #[instrument(skip_all, fields(session = %self.session, slots))]
    fn create_grid(&self, slots: u32) -> Result<()> {
        let workdir = self.workdir.display().to_string();
        for _ in 1..slots {
            self.run_checked(&["split-window", "-t", &self.session, "-c", &workdir])?;
            // Re-tile after every split so later splits have room.
            self.run_checked(&["select-layout", "-t", &self.session, "tiled"])?;
        }
        let panes = parse_pane_list(&self.run_capture(&[
            "list-panes",
            "-t",
            &self.session,
            "-F",
            "#{pane_index} #{pane_id}",
        ])?);
        if panes.len() < slots as usize {
            return Err(anyhow!(
                "tmux session {} has {} panes, expected {slots}",
                self.session,
                panes.len()
            ));
        }
        Ok(())
    }

    fn send_input(&self, slot: u32, text: &str) -> Result<()> {
        let target = self.pane_target(slot)?;
        self.run_checked(&["send-keys", "-t", &target, "-l", text])?;
        self.run_checked(&["send-keys", "-t", &target, "Enter"])?;
        Ok(())
    }

    fn interrupt(&self, slot: u32) -> Result<()> {
        let target = self.pane_target(slot)?;
        self.run_checked(&["send-keys", "-t", &target, "C-c"])?;
        Ok(())
    }

    #[instrument(skip_all, fields(session = %self.session))]
    fn destroy_context(&self) -> Result<()> {
        if let Err(err) = self.run_checked(&["kill-session", "-t", &self.session]) {
            if !self.context_exists().unwrap_or(true) {
                debug!("tmux session already gone");
                return Ok(());
            }
            warn!(err = %err, "failed to kill tmux session");
            return Err(err);
        }
        Ok(())
    }

    fn slot_ref(&self, slot: u32) -> String {
        format!("{}.{slot}", self.session)
    }
}

/// Parse `#{pane_index} #{pane_id}` lines into pane ids ordered by index.
fn parse_pane_list(out: &str) -> Vec<String> {
    let mut panes: Vec<(u32, String)> = out
        .lines()
        .filter_map(|line| {
            let (index, id) = line.trim().split_once(' ')?;
            Some((index.parse().ok()?, id.trim().to_string()))
        })
        .collect();
    panes.sort_by_key(|(index, _)| *index);
    panes.into_iter().map(|(_, id)| id).collect()
}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

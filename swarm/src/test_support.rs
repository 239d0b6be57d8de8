//! Scripted fakes for mission and lifecycle tests.

use std::collections::VecDeque;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::cancel::{CancelToken, Sleeper};
use crate::io::context::ContextProvider;
use crate::io::paths::{InitOptions, SwarmPaths, init_layout};
use crate::io::runtime::{AgentRuntime, Invocation, InvocationRequest, RuntimeBinaryMissing};

/// Create an initialized project in a fresh temp dir.
pub fn workspace() -> Result<(tempfile::TempDir, SwarmPaths)> {
    let temp = tempfile::tempdir()?;
    let paths = init_layout(temp.path(), &InitOptions { force: false })?;
    Ok((temp, paths))
}

/// One scripted session.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Files written (relative to the workdir) before the session "exits".
    pub files: Vec<(String, String)>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Cancel the mission mid-session, as Ctrl-C in the pane would.
    pub interrupt: bool,
    /// Fail as if the runtime binary were not installed.
    pub missing_binary: bool,
}

impl ScriptedSession {
    /// Clean exit with the completion marker and the given files.
    pub fn valid(files: &[(&str, &str)]) -> Self {
        Self {
            output: "working...\nSESSION_COMPLETE\n".to_string(),
            exit_code: Some(0),
            files: files
                .iter()
                .map(|(path, body)| (path.to_string(), body.to_string()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing(output: &str, exit_code: i32) -> Self {
        Self {
            output: output.to_string(),
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            output: "still thinking".to_string(),
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupt: true,
            ..Self::default()
        }
    }

    pub fn missing_binary() -> Self {
        Self {
            missing_binary: true,
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

/// Runtime that replays scripted sessions in order and records requests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRuntime {
    sessions: Arc<Mutex<VecDeque<ScriptedSession>>>,
    requests: Arc<Mutex<Vec<InvocationRequest>>>,
}

impl ScriptedRuntime {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn invoke(&self, request: &InvocationRequest, cancel: &CancelToken) -> Result<Invocation> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests poisoned"))?
            .push(request.clone());
        let session = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("sessions poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted runtime exhausted"))?;

        if session.missing_binary {
            return Err(RuntimeBinaryMissing {
                binary: "claude".to_string(),
            }
            .into());
        }
        for (rel, body) in &session.files {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, body)?;
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, &session.output)?;
        if session.interrupt {
            cancel.cancel();
        }

        Ok(Invocation {
            output: session.output,
            exit_code: if session.timed_out || session.interrupt {
                None
            } else {
                session.exit_code
            },
            timed_out: session.timed_out,
            interrupted: session.interrupt,
            elapsed: Duration::from_millis(5),
            tokens_in: session.tokens_in,
            tokens_out: session.tokens_out,
        })
    }
}

/// Sleeper that records requested pauses and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    pauses: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn pause(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if let Ok(mut pauses) = self.pauses.lock() {
            pauses.push(duration);
        }
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct FakeProviderState {
    pub exists: bool,
    pub slots: u32,
    pub inputs: Vec<(u32, String)>,
    pub interrupts: Vec<u32>,
    pub destroyed: u32,
    pub fail_grid: bool,
    /// Simulate loops that exit (and the session closing) on interrupt.
    pub exit_on_interrupt: bool,
}

/// In-memory execution context. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    pub state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: FakeProviderState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot<T>(&self, read: impl FnOnce(&FakeProviderState) -> T) -> T {
        match self.state.lock() {
            Ok(state) => read(&state),
            Err(poisoned) => read(&poisoned.into_inner()),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeProviderState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("fake provider poisoned"))?;
        f(&mut state)
    }
}

impl ContextProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn context_exists(&self) -> Result<bool> {
        self.with(|s| Ok(s.exists))
    }

    fn create_context(&self) -> Result<()> {
        self.with(|s| {
            s.exists = true;
            s.slots = 1;
            Ok(())
        })
    }

    fn create_grid(&self, slots: u32) -> Result<()> {
        self.with(|s| {
            if s.fail_grid {
                return Err(anyhow!("grid creation failed"));
            }
            s.slots = slots;
            Ok(())
        })
    }

    fn send_input(&self, slot: u32, text: &str) -> Result<()> {
        self.with(|s| {
            if !s.exists || slot >= s.slots {
                return Err(anyhow!("no slot {slot}"));
            }
            s.inputs.push((slot, text.to_string()));
            Ok(())
        })
    }

    fn interrupt(&self, slot: u32) -> Result<()> {
        self.with(|s| {
            s.interrupts.push(slot);
            if s.exit_on_interrupt && s.interrupts.len() as u32 >= s.slots {
                s.exists = false;
            }
            Ok(())
        })
    }

    fn destroy_context(&self) -> Result<()> {
        self.with(|s| {
            s.exists = false;
            s.destroyed += 1;
            Ok(())
        })
    }
}

//! Supervised child processes with timeouts, cancellation and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::{CancelToken, POLL_SLICE};

/// Captured output of a finished child. stdout and stderr are interleaved
/// line by line in arrival order.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub output: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.output).into_owned();
        if self.truncated > 0 {
            text.push_str(&format!("\n[output truncated {} bytes]\n", self.truncated));
        }
        text
    }
}

#[derive(Debug, Default)]
struct Collected {
    buf: Vec<u8>,
    truncated: usize,
}

type SharedStream = Arc<Option<Mutex<BufWriter<File>>>>;

/// A running child whose output is drained by helper threads.
#[derive(Debug)]
pub struct SupervisedChild {
    child: Child,
    started: Instant,
    collected: Arc<Mutex<Collected>>,
    readers: Vec<thread::JoinHandle<Result<()>>>,
}

impl SupervisedChild {
    /// Spawn `cmd`, feed `stdin` from a helper thread, and start draining
    /// stdout/stderr into memory (bounded by `output_limit_bytes`) and,
    /// unbounded, into `stream_path`.
    ///
    /// Spawn failures keep the underlying `std::io::Error` downcastable.
    #[instrument(skip_all, fields(output_limit_bytes, streaming = stream_path.is_some()))]
    pub fn spawn(
        mut cmd: Command,
        stdin: Option<Vec<u8>>,
        output_limit_bytes: usize,
        stream_path: Option<&Path>,
    ) -> Result<Self> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let stream: SharedStream = Arc::new(match stream_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create stream dir {}", parent.display()))?;
                }
                let file = File::create(path)
                    .with_context(|| format!("create stream file {}", path.display()))?;
                Some(Mutex::new(BufWriter::new(file)))
            }
            None => None,
        });

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(err = %err, "failed to spawn command");
                return Err(anyhow::Error::new(err).context("spawn command"));
            }
        };
        let started = Instant::now();

        if let Some(input) = stdin {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            // Dropping the handle closes the pipe so the child sees EOF.
            thread::spawn(move || {
                if let Err(err) = child_stdin.write_all(&input) {
                    warn!(err = %err, "failed to write child stdin");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let collected = Arc::new(Mutex::new(Collected::default()));
        let readers = vec![
            spawn_reader(stdout, output_limit_bytes, collected.clone(), stream.clone()),
            spawn_reader(stderr, output_limit_bytes, collected.clone(), stream),
        ];

        Ok(Self {
            child,
            started,
            collected,
            readers,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Deliver `sig` to the child.
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let pid = i32::try_from(self.child.id()).context("child pid out of range")?;
        signal::kill(Pid::from_raw(pid), sig).with_context(|| format!("send {sig} to child {pid}"))
    }

    /// Force-kill the child and reap it.
    pub fn kill(&mut self) -> Result<ExitStatus> {
        self.child.kill().context("kill command")?;
        self.child.wait().context("wait command after kill")
    }

    /// Wait for exit, polling in slices so `cancel` is observed promptly.
    ///
    /// On timeout the child is killed. On cancellation it receives SIGINT,
    /// gets `grace` to exit, and is then killed.
    #[instrument(skip_all, fields(pid = self.child.id(), timeout_secs = timeout.as_secs()))]
    pub fn wait(mut self, timeout: Duration, cancel: &CancelToken, grace: Duration) -> Result<CommandOutput> {
        let deadline = self.started + timeout;
        let mut timed_out = false;
        let mut interrupted = false;

        let status = loop {
            if let Some(status) = self.child.wait_timeout(POLL_SLICE).context("wait for command")? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!("interrupt requested; signalling child");
                interrupted = true;
                break self.interrupt_then_kill(grace)?;
            }
            if Instant::now() >= deadline {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                timed_out = true;
                break self.kill()?;
            }
        };

        for reader in self.readers.drain(..) {
            match reader.join() {
                Ok(result) => result.context("drain child output")?,
                Err(_) => return Err(anyhow!("output reader thread panicked")),
            }
        }
        let collected = std::mem::take(
            &mut *self
                .collected
                .lock()
                .map_err(|_| anyhow!("output buffer poisoned"))?,
        );
        if collected.truncated > 0 {
            warn!(truncated = collected.truncated, "output truncated");
        }

        let elapsed = self.started.elapsed();
        debug!(exit_code = ?status.code(), timed_out, interrupted, elapsed_ms = elapsed.as_millis() as u64, "command finished");
        Ok(CommandOutput {
            status,
            output: collected.buf,
            truncated: collected.truncated,
            timed_out,
            interrupted,
            elapsed,
        })
    }

    fn interrupt_then_kill(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Err(err) = self.signal(Signal::SIGINT) {
            warn!(err = %err, "failed to interrupt child");
        }
        match self.child.wait_timeout(grace).context("wait after interrupt")? {
            Some(status) => Ok(status),
            None => {
                warn!(grace_secs = grace.as_secs(), "child ignored interrupt, killing");
                self.kill()
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    collected: Arc<Mutex<Collected>>,
    stream: SharedStream,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || read_lines_limited(reader, limit, &collected, &stream))
}

/// Read line by line, tee-ing each line to the stream file and keeping at
/// most `limit` bytes in memory.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    collected: &Mutex<Collected>,
    stream: &SharedStream,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            return Ok(());
        }

        if let Some(mutex) = stream.as_ref()
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(err) = writer.write_all(&line) {
                warn!(err = %err, "failed to write to stream file");
            } else if let Err(err) = writer.flush() {
                warn!(err = %err, "failed to flush stream file");
            }
        }

        let mut guard = collected
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let remaining = limit.saturating_sub(guard.buf.len());
        let keep = n.min(remaining);
        guard.buf.extend_from_slice(&line[..keep]);
        guard.truncated += n - keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_command_with_timeout(
        cmd: Command,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput> {
        SupervisedChild::spawn(cmd, stdin, output_limit_bytes, None)?.wait(
            timeout,
            &CancelToken::new(),
            Duration::ZERO,
        )
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr_together() {
        let out = run_command_with_timeout(
            sh("echo out; echo err 1>&2"),
            None,
            Duration::from_secs(10),
            10_000,
        )
        .expect("run");
        let text = out.text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(out.exit_code(), Some(0));
    }

    #[test]
    fn stdin_is_delivered() {
        let out = run_command_with_timeout(
            sh("cat"),
            Some(b"prompt body".to_vec()),
            Duration::from_secs(10),
            10_000,
        )
        .expect("run");
        assert_eq!(out.text(), "prompt body");
    }

    #[test]
    fn timeout_kills_child() {
        let out = run_command_with_timeout(sh("sleep 30"), None, Duration::from_millis(300), 1_000)
            .expect("run");
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn output_is_bounded_but_streamed_in_full() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs/session-1.log");
        let child = SupervisedChild::spawn(
            sh("for i in 1 2 3 4 5 6 7 8 9 10; do echo line$i; done"),
            None,
            12,
            Some(&stream),
        )
        .expect("spawn");
        let out = child
            .wait(Duration::from_secs(10), &CancelToken::new(), Duration::ZERO)
            .expect("wait");
        assert_eq!(out.output.len(), 12);
        assert!(out.truncated > 0);
        let streamed = std::fs::read_to_string(&stream).expect("read stream");
        assert!(streamed.contains("line10"));
    }

    #[test]
    fn cancellation_interrupts_child() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let child = SupervisedChild::spawn(sh("sleep 30"), None, 1_000, None).expect("spawn");
        let out = child
            .wait(Duration::from_secs(60), &cancel, Duration::from_secs(2))
            .expect("wait");
        assert!(out.interrupted);
        assert!(!out.timed_out);
        assert!(out.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn missing_binary_keeps_io_error() {
        let err = SupervisedChild::spawn(
            Command::new("definitely-not-a-real-binary-7f3a"),
            None,
            1_000,
            None,
        )
        .expect_err("spawn should fail");
        let io = err.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}

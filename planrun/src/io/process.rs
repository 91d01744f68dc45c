//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::fmt;
use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// Interval between cancellation checks while waiting on a child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The child process could not be started at all.
#[derive(Debug)]
pub struct SpawnError {
    pub program: String,
    pub reason: String,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to spawn {}: {}", self.program, self.reason)
    }
}

impl std::error::Error for SpawnError {}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        text
    }

    pub fn stderr_lossy(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Limits applied to a single child process run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits<'a> {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child is placed in its own process group so a timeout or cancellation kills every
/// process it started, not only the direct child. Output is read concurrently while the child
/// runs; bytes beyond `output_limit_bytes` are drained and counted but not stored.
///
/// A child that cannot be spawned yields an error whose root cause is [`SpawnError`].
#[instrument(skip_all, fields(timeout_secs = limits.timeout.as_secs(), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    limits: RunLimits<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(%program, "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, %program, "failed to spawn command");
            return Err(anyhow::Error::new(SpawnError {
                program,
                reason: e.to_string(),
            }));
        }
    };
    let pid = child.id();
    let mut guard = ChildGuard::new(&mut child);

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = guard
                .child()
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that exits without reading stdin closes the pipe; that is not our failure.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let stdout = guard
        .child()
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = guard
        .child()
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = limits.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let deadline = started + limits.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(
                timeout_secs = limits.timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            break guard.kill_and_reap()?;
        }
        if limits.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing process group");
            cancelled = true;
            break guard.kill_and_reap()?;
        }
        let slice = (deadline - now).min(POLL_INTERVAL);
        if let Some(status) = guard
            .child()
            .wait_timeout(slice)
            .context("wait for command")?
        {
            guard.disarm();
            // Background processes left behind would hold the output pipes open.
            kill_stragglers(pid);
            break status;
        }
    };

    if let Some(handle) = stdin_handle {
        if handle.join().is_err() {
            warn!("stdin writer thread panicked");
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let duration = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, cancelled, elapsed_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration,
    })
}

/// Kills the child's process group if dropped before the child was reaped.
struct ChildGuard<'a> {
    child: &'a mut Child,
    armed: bool,
}

impl<'a> ChildGuard<'a> {
    fn new(child: &'a mut Child) -> Self {
        Self { child, armed: true }
    }

    fn child(&mut self) -> &mut Child {
        &mut *self.child
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn kill_and_reap(&mut self) -> Result<ExitStatus> {
        kill_process_group(&mut *self.child);
        let status = self.child.wait().context("wait command after kill")?;
        self.armed = false;
        Ok(status)
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            kill_process_group(&mut *self.child);
            let _ = self.child.wait();
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    if !signal_group(child.id()) {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_stragglers(pid: u32) {
    signal_group(pid);
}

#[cfg(not(unix))]
fn kill_stragglers(_pid: u32) {}

/// Send SIGKILL to the process group led by `pid`. Returns false if no signal was delivered.
#[cfg(unix)]
fn signal_group(pid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => true,
        Err(err) => {
            debug!(%err, pid, "killpg did not deliver");
            false
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn limits(timeout: Duration) -> RunLimits<'static> {
        RunLimits {
            timeout,
            output_limit_bytes: 1024,
            cancel: None,
        }
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_command(cmd, None, limits(Duration::from_secs(5))).expect("run");
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat");
        let output =
            run_command(cmd, Some(b"hello"), limits(Duration::from_secs(5))).expect("run");
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
    }

    #[test]
    fn large_stdin_to_a_non_reading_child_still_times_out() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 8");
        let input = vec![b'x'; 1024 * 1024];
        let started = Instant::now();
        let output = run_command(cmd, Some(&input), limits(Duration::from_secs(1))).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    }

    #[test]
    fn kills_on_timeout_including_grandchildren() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30; wait");
        let started = Instant::now();
        let output = run_command(cmd, None, limits(Duration::from_millis(300))).expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("head -c 5000 /dev/zero");
        let output = run_command(cmd, None, limits(Duration::from_secs(5))).expect("run");
        assert_eq!(output.stdout.len(), 1024);
        assert_eq!(output.stdout_truncated, 5000 - 1024);
        assert!(output.stdout_lossy().contains("stdout truncated"));
    }

    #[test]
    fn cancellation_stops_child() {
        let token = CancelToken::new();
        token.cancel();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let output = run_command(
            cmd,
            None,
            RunLimits {
                timeout: Duration::from_secs(30),
                output_limit_bytes: 1024,
                cancel: Some(&token),
            },
        )
        .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let cmd = Command::new("/nonexistent/planrun-binary");
        let err = run_command(cmd, None, limits(Duration::from_secs(1))).unwrap_err();
        assert!(err.downcast_ref::<SpawnError>().is_some());
    }
}

//! Isolated execution of generated code.
//!
//! The [`Sandbox`] trait is the single entry point for running a snippet. Backends
//! (docker, local process) differ in how they isolate the run but share the same
//! contract:
//! - The snippet runs with the request's scratch directory as its working directory.
//! - The run is force-stopped at `timeout` or when the cancel token fires.
//! - `generated_files` is the diff of the scratch directory before and after the run.
//! - A backend that cannot start the snippet at all returns an error whose root cause
//!   is [`SandboxError::Launch`]; anything the snippet itself does is a result.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::{SandboxBackend, SandboxConfig};
use crate::io::docker::DockerSandbox;
use crate::io::process::{CommandOutput, RunLimits, SpawnError, run_command};
use crate::io::snapshot::DirSnapshot;

/// Environment variable pointing at the read-only data directory for the process backend.
pub const DATA_DIR_ENV: &str = "PLANRUN_DATA_DIR";

/// One sandboxed run.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    /// Read-write scratch directory; created if missing.
    pub workspace: PathBuf,
    /// Optional read-only data directory.
    pub data_dir: Option<PathBuf>,
    pub memory_mb: u64,
    pub network_disabled: bool,
    pub timeout: Duration,
}

/// What a sandboxed run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    /// New or modified files, relative to the scratch directory.
    pub generated_files: Vec<PathBuf>,
    pub duration: Duration,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl SandboxResult {
    /// A run succeeds when it exited 0 on its own. With `stderr_is_failure`, any stderr
    /// output also fails the run.
    pub fn succeeded(&self, stderr_is_failure: bool) -> bool {
        !self.timed_out
            && !self.cancelled
            && self.exit_code == Some(0)
            && !(stderr_is_failure && !self.stderr.trim().is_empty())
    }

    /// Human-readable failure description handed to the repair step.
    pub fn failure_report(&self) -> String {
        let mut report = String::new();
        match self.exit_code {
            Some(code) => report.push_str(&format!("Exit Code: {code}\n")),
            None => report.push_str("Exit Code: none (killed)\n"),
        }
        if self.timed_out {
            report.push_str(&format!(
                "Timed out: execution was stopped after {:.1}s\n",
                self.duration.as_secs_f64()
            ));
        }
        if self.cancelled {
            report.push_str("Cancelled: the plan was cancelled during execution\n");
        }
        report.push_str(&format!("Stderr: {}\n", self.stderr.trim_end()));
        report.push_str(&format!("Stdout: {}", self.stdout.trim_end()));
        report
    }

    pub(crate) fn from_output(output: &CommandOutput, generated_files: Vec<PathBuf>) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            timed_out: output.timed_out,
            cancelled: output.cancelled,
            generated_files,
            duration: output.duration,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
        }
    }
}

/// The sandbox could not run the snippet.
#[derive(Debug)]
pub enum SandboxError {
    Launch { backend: &'static str, reason: String },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Launch { backend, reason } => {
                write!(f, "{backend} sandbox failed to launch: {reason}")
            }
        }
    }
}

impl std::error::Error for SandboxError {}

/// Runs one snippet in isolation.
pub trait Sandbox: Send + Sync {
    fn run(&self, request: &SandboxRequest, cancel: &CancelToken) -> Result<SandboxResult>;
}

/// Build the backend selected in config.
pub fn sandbox_from_config(cfg: &SandboxConfig) -> Box<dyn Sandbox> {
    match cfg.backend {
        SandboxBackend::Docker => Box::new(DockerSandbox::from_config(cfg)),
        SandboxBackend::Process => Box::new(ProcessSandbox::from_config(cfg)),
    }
}

/// Write `code` into a fresh private directory that lives as long as the returned guard.
pub(crate) fn write_script(script_name: &str, code: &str) -> Result<(TempDir, PathBuf)> {
    let dir = tempfile::Builder::new()
        .prefix("planrun-script-")
        .tempdir()
        .context("create script dir")?;
    let path = dir.path().join(script_name);
    fs::write(&path, code).with_context(|| format!("write script {}", path.display()))?;
    Ok((dir, path))
}

/// Run `cmd` between two snapshots of `workspace`.
///
/// Spawn failures are mapped to [`SandboxError::Launch`] for `backend`.
pub(crate) fn run_with_diff(
    backend: &'static str,
    cmd: Command,
    workspace: &Path,
    limits: RunLimits<'_>,
) -> Result<(CommandOutput, Vec<PathBuf>)> {
    let before = DirSnapshot::capture(workspace)?;
    let output = match run_command(cmd, None, limits) {
        Ok(output) => output,
        Err(err) => {
            if let Some(spawn) = err.downcast_ref::<SpawnError>() {
                return Err(anyhow::Error::new(SandboxError::Launch {
                    backend,
                    reason: spawn.to_string(),
                }));
            }
            return Err(err.context(format!("{backend} sandbox run")));
        }
    };
    let after = DirSnapshot::capture(workspace)?;
    Ok((output, before.changed_since(&after)))
}

/// Local interpreter in its own process group.
///
/// Memory is capped with `ulimit -v`. Network access is not restricted.
#[derive(Debug)]
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    script_name: String,
    output_limit_bytes: usize,
    warned_network: AtomicBool,
}

impl ProcessSandbox {
    pub fn new(interpreter: Vec<String>, script_name: &str, output_limit_bytes: usize) -> Self {
        Self {
            interpreter,
            script_name: script_name.to_string(),
            output_limit_bytes,
            warned_network: AtomicBool::new(false),
        }
    }

    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self::new(
            cfg.interpreter.clone(),
            &cfg.script_name,
            cfg.output_limit_bytes,
        )
    }

    fn command(&self, request: &SandboxRequest, script: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"ulimit -v "$1" 2>/dev/null; shift; exec "$@""#)
            .arg("planrun-sandbox")
            .arg((request.memory_mb * 1024).to_string())
            .args(&self.interpreter)
            .arg(script)
            .current_dir(&request.workspace);
        match &request.data_dir {
            Some(dir) => {
                cmd.env(DATA_DIR_ENV, dir);
            }
            None => {
                cmd.env_remove(DATA_DIR_ENV);
            }
        }
        cmd
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(backend = "process", workspace = %request.workspace.display(), timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SandboxRequest, cancel: &CancelToken) -> Result<SandboxResult> {
        if request.network_disabled && !self.warned_network.swap(true, Ordering::Relaxed) {
            warn!("process sandbox does not enforce network isolation");
        }
        fs::create_dir_all(&request.workspace).with_context(|| {
            format!("create sandbox workspace {}", request.workspace.display())
        })?;
        let program = self.interpreter.first().map(String::as_str).unwrap_or_default();
        if find_program(program).is_none() {
            return Err(anyhow::Error::new(SandboxError::Launch {
                backend: "process",
                reason: format!("interpreter '{program}' not found"),
            }));
        }
        let (_script_dir, script) = write_script(&self.script_name, &request.code)?;
        debug!(script = %script.display(), "running snippet");

        let (output, generated) = run_with_diff(
            "process",
            self.command(request, &script),
            &request.workspace,
            RunLimits {
                timeout: request.timeout,
                output_limit_bytes: self.output_limit_bytes,
                cancel: Some(cancel),
            },
        )?;
        let result = SandboxResult::from_output(&output, generated);
        info!(
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            files = result.generated_files.len(),
            "process sandbox finished"
        );
        Ok(result)
    }
}

/// Resolve `program` the way `exec` would: as a path when it contains a separator,
/// otherwise through `PATH`.
pub(crate) fn find_program(program: &str) -> Option<PathBuf> {
    if program.trim().is_empty() {
        return None;
    }
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

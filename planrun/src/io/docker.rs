//! Docker sandbox backend.
//!
//! Each run gets a uniquely named container:
//! `docker run --rm --network none --memory <m> -v <ws>:/workspace:rw -v <data>:/data:ro
//! -v <script>:/sandbox:ro <image> <interpreter> /sandbox/<script>`.
//! Killing the `docker run` client does not stop the container, so a guard removes it
//! with `docker rm -f` whenever the run did not end on its own.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::SandboxConfig;
use crate::io::process::{RunLimits, run_command};
use crate::io::sandbox::{
    Sandbox, SandboxError, SandboxRequest, SandboxResult, run_with_diff, write_script,
};

/// `docker run` exits 125 when the daemon could not create or start the container.
const DOCKER_LAUNCH_FAILURE: i32 = 125;

#[derive(Debug, Clone)]
pub struct DockerSandbox {
    image: String,
    interpreter: Vec<String>,
    script_name: String,
    output_limit_bytes: usize,
    grace: Duration,
}

impl DockerSandbox {
    pub fn from_config(cfg: &SandboxConfig) -> Self {
        Self {
            image: cfg.image.clone(),
            interpreter: cfg.interpreter.clone(),
            script_name: cfg.script_name.clone(),
            output_limit_bytes: cfg.output_limit_bytes,
            grace: Duration::from_secs(cfg.grace_secs),
        }
    }

    fn docker_args(&self, request: &DockerMounts<'_>, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if request.network_disabled {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        args.extend([
            "--memory".to_string(),
            format!("{}m", request.memory_mb),
            "--memory-swap".to_string(),
            format!("{}m", request.memory_mb),
            "-v".to_string(),
            format!("{}:/workspace:rw", request.workspace.display()),
        ]);
        if let Some(data) = request.data_dir {
            args.extend(["-v".to_string(), format!("{}:/data:ro", data.display())]);
        }
        args.extend([
            "-v".to_string(),
            format!("{}:/sandbox:ro", request.script_dir.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            self.image.clone(),
        ]);
        args.extend(self.interpreter.iter().cloned());
        args.push(format!("/sandbox/{}", self.script_name));
        args
    }
}

/// Absolute host paths for the three mounts.
struct DockerMounts<'a> {
    workspace: &'a Path,
    data_dir: Option<&'a Path>,
    script_dir: &'a Path,
    memory_mb: u64,
    network_disabled: bool,
}

impl Sandbox for DockerSandbox {
    #[instrument(skip_all, fields(backend = "docker", image = %self.image, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &SandboxRequest, cancel: &CancelToken) -> Result<SandboxResult> {
        fs::create_dir_all(&request.workspace).with_context(|| {
            format!("create sandbox workspace {}", request.workspace.display())
        })?;
        let workspace = canonical(&request.workspace)?;
        let data_dir = match &request.data_dir {
            Some(dir) => Some(canonical(dir)?),
            None => None,
        };
        let (script_dir, _script) = write_script(&self.script_name, &request.code)?;
        let name = container_name();
        let args = self.docker_args(
            &DockerMounts {
                workspace: &workspace,
                data_dir: data_dir.as_deref(),
                script_dir: script_dir.path(),
                memory_mb: request.memory_mb,
                network_disabled: request.network_disabled,
            },
            &name,
        );
        debug!(container = %name, "starting container");

        let mut guard = ContainerGuard::new(&name, self.grace);
        let mut cmd = Command::new("docker");
        cmd.args(&args);
        let (output, generated) = run_with_diff(
            "docker",
            cmd,
            &workspace,
            RunLimits {
                timeout: request.timeout,
                output_limit_bytes: self.output_limit_bytes,
                cancel: Some(cancel),
            },
        )?;

        if !output.timed_out && !output.cancelled {
            guard.disarm();
            if output.status.code() == Some(DOCKER_LAUNCH_FAILURE) {
                return Err(anyhow::Error::new(SandboxError::Launch {
                    backend: "docker",
                    reason: output.stderr_lossy().trim().to_string(),
                }));
            }
        }

        let result = SandboxResult::from_output(&output, generated);
        info!(
            container = %name,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            files = result.generated_files.len(),
            "docker sandbox finished"
        );
        Ok(result)
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("resolve mount {}", path.display()))
}

fn container_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(12)
        .collect::<String>()
        .to_lowercase();
    format!("planrun-{suffix}")
}

/// Force-removes the container on drop unless the run ended on its own.
struct ContainerGuard {
    name: String,
    grace: Duration,
    armed: bool,
}

impl ContainerGuard {
    fn new(name: &str, grace: Duration) -> Self {
        Self {
            name: name.to_string(),
            grace,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut cmd = Command::new("docker");
        cmd.arg("rm").arg("-f").arg(&self.name);
        let limits = RunLimits {
            timeout: self.grace.max(Duration::from_secs(1)),
            output_limit_bytes: 4096,
            cancel: None,
        };
        match run_command(cmd, None, limits) {
            Ok(output) if output.status.success() => {
                debug!(container = %self.name, "container removed");
            }
            Ok(output) => {
                debug!(container = %self.name, stderr = %output.stderr_lossy().trim(), "docker rm -f reported failure");
            }
            Err(err) => warn!(container = %self.name, err = %err, "failed to remove container"),
        }
    }
}

//! Engine configuration stored under `.planrun/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to the
/// values in [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Main-loop sandbox invocations per node, including the first run.
    pub max_fix_attempts: u32,

    /// Upper bound on information-gathering probes per node.
    pub max_info_rounds: u32,

    /// Sandbox invocations allowed for a single probe, including its first run.
    pub max_info_fix_attempts: u32,

    /// Nodes executed concurrently.
    pub workers: usize,

    /// Characters kept from each dependency/child output in a node's context.
    pub context_output_limit_chars: usize,

    /// Characters of data-directory summary shown to the agent. Zero disables it.
    pub data_summary_limit_chars: usize,

    /// Wall-clock budget for a whole run. Unset means unbounded.
    pub plan_timeout_secs: Option<u64>,

    /// Count a zero exit with non-empty stderr as a failed run.
    pub treat_stderr_as_failure: bool,

    pub sandbox: SandboxConfig,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Docker,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,

    /// Container image for the docker backend.
    pub image: String,

    /// Interpreter argv; the script path is appended.
    pub interpreter: Vec<String>,

    /// File name the generated code is written to.
    pub script_name: String,

    pub memory_mb: u64,

    pub network_disabled: bool,

    pub timeout_secs: u64,

    /// Extra time allowed for teardown after a timeout before the run is abandoned.
    pub grace_secs: u64,

    /// Bytes kept from each of stdout/stderr.
    pub output_limit_bytes: usize,

    /// Read-only data directory mounted at `/data`.
    pub data_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "python:3.11-slim".to_string(),
            interpreter: vec!["python3".to_string()],
            script_name: "main.py".to_string(),
            memory_mb: 512,
            network_disabled: true,
            timeout_secs: 120,
            grace_secs: 5,
            output_limit_bytes: 1_000_000,
            data_dir: None,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command that reads a prompt on stdin and prints a JSON object (e.g. `["llm"]`).
    pub command: Vec<String>,

    pub timeout_secs: u64,

    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: 5,
            max_info_rounds: 3,
            max_info_fix_attempts: 3,
            workers: 1,
            context_output_limit_chars: 2000,
            data_summary_limit_chars: 4000,
            plan_timeout_secs: None,
            treat_stderr_as_failure: false,
            sandbox: SandboxConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_fix_attempts == 0 {
            return Err(anyhow!("max_fix_attempts must be > 0"));
        }
        if self.max_info_fix_attempts == 0 {
            return Err(anyhow!("max_info_fix_attempts must be > 0"));
        }
        if self.workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.plan_timeout_secs == Some(0) {
            return Err(anyhow!("plan_timeout_secs must be > 0 when set"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.memory_mb == 0 {
            return Err(anyhow!("sandbox.memory_mb must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if is_blank_argv(&self.sandbox.interpreter) {
            return Err(anyhow!("sandbox.interpreter must be a non-empty array"));
        }
        if self.sandbox.script_name.trim().is_empty() || self.sandbox.script_name.contains('/') {
            return Err(anyhow!("sandbox.script_name must be a plain file name"));
        }
        if self.sandbox.backend == SandboxBackend::Docker && self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image is required for the docker backend"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if is_blank_argv(&self.agent.command) {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn plan_timeout(&self) -> Option<Duration> {
        self.plan_timeout_secs.map(Duration::from_secs)
    }
}

fn is_blank_argv(argv: &[String]) -> bool {
    argv.first().is_none_or(|program| program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fsutil::write_atomic(path, buf.as_bytes())
}

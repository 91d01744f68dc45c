//! Agent backed by an external command (e.g. an LLM CLI).
//!
//! Each call renders a prompt, feeds it to the configured command on stdin, and
//! parses the JSON object the command prints. Markdown fences around the JSON
//! are tolerated.

use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::classifier::parse_task_type;
use crate::core::context::truncate_chars;
use crate::core::response::parse_json_response;
use crate::core::types::TaskType;
use crate::io::agent::{
    AgentError, Classifier, GeneratedCode, Generator, InfoProbe, TaskBrief,
};
use crate::io::config::AgentConfig;
use crate::io::process::{RunLimits, SpawnError, run_command};
use crate::io::prompt::{PromptEngine, PromptKind};

const EXCERPT_CHARS: usize = 300;

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    #[serde(default)]
    task_type: String,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    need_more_info: bool,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct CodeOnlyResponse {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct AnswerResponse {
    answer: String,
}

pub struct CommandAgent {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompts: PromptEngine,
    cancel: Option<CancelToken>,
}

impl CommandAgent {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            prompts: PromptEngine::new(),
            cancel: None,
        }
    }

    /// Stop in-flight agent commands when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the command with `prompt` on stdin and return its stdout.
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs(), prompt_bytes = prompt.len()))]
    fn call(&self, prompt: &str) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| AgentError::Command {
                reason: "agent.command is empty".to_string(),
            })?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = match run_command(
            cmd,
            Some(prompt.as_bytes()),
            RunLimits {
                timeout: self.timeout,
                output_limit_bytes: self.output_limit_bytes,
                cancel: self.cancel.as_ref(),
            },
        ) {
            Ok(output) => output,
            Err(err) => {
                if let Some(spawn) = err.downcast_ref::<SpawnError>() {
                    return Err(AgentError::Command {
                        reason: spawn.to_string(),
                    }
                    .into());
                }
                return Err(err);
            }
        };

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent command timed out");
            return Err(AgentError::TimedOut {
                secs: self.timeout.as_secs(),
            }
            .into());
        }
        if output.cancelled {
            return Err(AgentError::Command {
                reason: "cancelled".to_string(),
            }
            .into());
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "agent command failed");
            return Err(AgentError::Command {
                reason: format!(
                    "exit status {:?}: {}",
                    output.status.code(),
                    truncate_chars(stderr.trim(), EXCERPT_CHARS)
                ),
            }
            .into());
        }
        debug!(stdout_bytes = output.stdout.len(), "agent command finished");
        Ok(output.stdout_lossy())
    }

    fn ask<T: DeserializeOwned>(
        &self,
        kind: PromptKind,
        brief: &TaskBrief<'_>,
        code: Option<&str>,
        failure: Option<&str>,
    ) -> Result<T> {
        let prompt = self.prompts.render(kind, brief, code, failure)?;
        let raw = self.call(&prompt)?;
        parse_json_response(&raw).map_err(|reason| {
            AgentError::Unparseable {
                reason,
                excerpt: truncate_chars(raw.trim(), EXCERPT_CHARS),
            }
            .into()
        })
    }
}

impl Classifier for CommandAgent {
    fn classify(&self, brief: &TaskBrief<'_>) -> Result<TaskType> {
        let response: ClassifyResponse = self.ask(PromptKind::Classify, brief, None, None)?;
        parse_task_type(&response.task_type).ok_or_else(|| {
            AgentError::Unparseable {
                reason: "task_type must be code_required or text_only".to_string(),
                excerpt: truncate_chars(&response.task_type, EXCERPT_CHARS),
            }
            .into()
        })
    }
}

impl Generator for CommandAgent {
    fn generate_code(&self, brief: &TaskBrief<'_>) -> Result<GeneratedCode> {
        let generated: GeneratedCode = self.ask(PromptKind::Code, brief, None, None)?;
        if generated.is_empty() {
            return Err(AgentError::Empty { what: "code" }.into());
        }
        Ok(generated)
    }

    fn generate_answer(&self, brief: &TaskBrief<'_>) -> Result<String> {
        let prompt = self.prompts.render(PromptKind::Answer, brief, None, None)?;
        let raw = self.call(&prompt)?;
        // Plain-text answers are accepted as-is.
        let answer = parse_json_response::<AnswerResponse>(&raw)
            .map(|response| response.answer)
            .unwrap_or_else(|_| raw.trim().to_string());
        if answer.trim().is_empty() {
            return Err(AgentError::Empty { what: "answer" }.into());
        }
        Ok(answer)
    }

    fn repair_code(
        &self,
        brief: &TaskBrief<'_>,
        code: &str,
        failure: &str,
    ) -> Result<GeneratedCode> {
        self.ask(PromptKind::Repair, brief, Some(code), Some(failure))
    }
}

impl InfoProbe for CommandAgent {
    fn probe(&self, brief: &TaskBrief<'_>) -> Result<Option<String>> {
        let response: ProbeResponse = self.ask(PromptKind::Probe, brief, None, None)?;
        if response.need_more_info && !response.code.trim().is_empty() {
            Ok(Some(response.code))
        } else {
            Ok(None)
        }
    }

    fn repair_probe(&self, brief: &TaskBrief<'_>, code: &str, failure: &str) -> Result<String> {
        let response: CodeOnlyResponse =
            self.ask(PromptKind::ProbeRepair, brief, Some(code), Some(failure))?;
        Ok(response.code)
    }
}

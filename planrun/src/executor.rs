//! Per-node execution: classify, gather information, generate, run, repair.
//!
//! The executor never fails the run. Every outcome, including collaborator and
//! sandbox launch errors, ends up in the returned [`NodeExecutionRecord`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::effective_timeout;
use crate::core::cancel::CancelToken;
use crate::core::classifier::forced_task_type;
use crate::core::context::{NodeContext, unmet_warning};
use crate::core::types::{NodeExecutionRecord, TaskType};
use crate::io::agent::{Agent, GeneratedCode, TaskBrief};
use crate::io::config::EngineConfig;
use crate::io::events::{EventKind, EventSink, ProgressEvent};
use crate::io::sandbox::{Sandbox, SandboxError, SandboxRequest, SandboxResult};
use crate::plan::{NodeStatus, PlanNode};

/// Bounds and sandbox limits applied to every node of a run.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub max_fix_attempts: u32,
    pub max_info_rounds: u32,
    pub max_info_fix_attempts: u32,
    pub sandbox_timeout: Duration,
    pub memory_mb: u64,
    pub network_disabled: bool,
    pub data_dir: Option<PathBuf>,
    pub treat_stderr_as_failure: bool,
    /// Task type forced for every node of the run.
    pub force_task_type: Option<TaskType>,
    /// Rendered description of the data directory, shared by every node.
    pub data_summary: String,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &EngineConfig, force_task_type: Option<TaskType>) -> Self {
        Self {
            max_fix_attempts: cfg.max_fix_attempts,
            max_info_rounds: cfg.max_info_rounds,
            max_info_fix_attempts: cfg.max_info_fix_attempts,
            sandbox_timeout: cfg.sandbox.timeout(),
            memory_mb: cfg.sandbox.memory_mb,
            network_disabled: cfg.sandbox.network_disabled,
            data_dir: cfg.sandbox.data_dir.clone(),
            treat_stderr_as_failure: cfg.treat_stderr_as_failure,
            force_task_type,
            data_summary: String::new(),
        }
    }
}

/// Everything needed to execute one node.
#[derive(Debug, Clone)]
pub struct NodeJob {
    pub plan_id: String,
    pub node: PlanNode,
    pub context: NodeContext,
    /// Scratch directory mounted read-write for this node.
    pub workspace: PathBuf,
    /// Prefix turning workspace-relative paths into plan-output-relative ones.
    pub output_prefix: String,
}

/// Why a node ended `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFailure {
    Classification(String),
    Generation(String),
    /// Code kept failing after every allowed attempt.
    Runtime { attempts: u32, last_failure: String },
    SandboxLaunch(String),
    Cancelled,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeFailure::Classification(reason) => write!(f, "classification failed: {reason}"),
            NodeFailure::Generation(reason) => write!(f, "generation failed: {reason}"),
            NodeFailure::Runtime {
                attempts,
                last_failure,
            } => write!(
                f,
                "code failed after {attempts} attempt(s); last failure:\n{last_failure}"
            ),
            NodeFailure::SandboxLaunch(reason) => f.write_str(reason),
            NodeFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for NodeFailure {}

/// Drives one node through the execution state machine.
pub struct TaskExecutor<'a, A: Agent + ?Sized, S: Sandbox + ?Sized> {
    pub agent: &'a A,
    pub sandbox: &'a S,
    pub settings: &'a ExecutorSettings,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancelToken,
}

/// Mutable state while a node runs.
struct Attempt<'j> {
    job: &'j NodeJob,
    data_summary: &'j str,
    record: NodeExecutionRecord,
    gathered: String,
}

impl Attempt<'_> {
    fn brief(&self) -> TaskBrief<'_> {
        TaskBrief::new(&self.job.node, &self.job.context.text, &self.gathered)
            .with_data(self.data_summary)
    }

    fn fail(mut self, failure: NodeFailure) -> NodeExecutionRecord {
        self.record.error_message = Some(failure.to_string());
        self.finish(NodeStatus::Failed)
    }

    fn finish(mut self, status: NodeStatus) -> NodeExecutionRecord {
        self.record.status = status;
        if !self.gathered.trim().is_empty() {
            self.record.gathered_info = Some(self.gathered);
        }
        self.record.completed_at = Utc::now();
        self.record
    }
}

enum ProbeOutcome {
    Output(String),
    Failed(String),
    Cancelled,
}

impl<A: Agent + ?Sized, S: Sandbox + ?Sized> TaskExecutor<'_, A, S> {
    #[instrument(skip_all, fields(plan_id = %job.plan_id, node_id = %job.node.id))]
    pub fn execute(&self, job: &NodeJob) -> NodeExecutionRecord {
        let mut attempt = Attempt {
            job,
            data_summary: &self.settings.data_summary,
            record: NodeExecutionRecord::new(NodeStatus::Running, Utc::now()),
            gathered: String::new(),
        };
        attempt.record.unmet_dependencies = job.context.unmet.clone();
        if let Some(warning) = unmet_warning(&job.context.unmet) {
            warn!(unmet = ?job.context.unmet, "running with unmet dependencies");
            attempt.gathered.push_str(&warning);
        }
        if self.cancel.is_cancelled() {
            return attempt.fail(NodeFailure::Cancelled);
        }

        let task_type = match forced_task_type(self.settings.force_task_type, job.node.task_type)
        {
            Some(forced) => {
                debug!(task_type = %forced, "task type forced");
                forced
            }
            None => match self.agent.classify(&attempt.brief()) {
                Ok(task_type) => task_type,
                Err(err) => return attempt.fail(NodeFailure::Classification(format!("{err:#}"))),
            },
        };
        attempt.record.task_type = Some(task_type);
        self.emit(job, EventKind::Classified, format!("classified as {task_type}"), None);

        match task_type {
            TaskType::TextOnly => self.answer(attempt),
            TaskType::CodeRequired => self.run_code(attempt),
        }
    }

    fn answer(&self, mut attempt: Attempt<'_>) -> NodeExecutionRecord {
        match self.agent.generate_answer(&attempt.brief()) {
            Ok(answer) => {
                attempt.record.text_response = Some(answer);
                attempt.finish(NodeStatus::Completed)
            }
            Err(err) => attempt.fail(NodeFailure::Generation(format!("{err:#}"))),
        }
    }

    fn run_code(&self, mut attempt: Attempt<'_>) -> NodeExecutionRecord {
        if let Err(failure) = self.gather_info(&mut attempt) {
            return attempt.fail(failure);
        }

        let mut current = match self.agent.generate_code(&attempt.brief()) {
            Ok(generated) if !generated.is_empty() => generated,
            Ok(_) => {
                return attempt.fail(NodeFailure::Generation(
                    "generator returned no code".to_string(),
                ));
            }
            Err(err) => return attempt.fail(NodeFailure::Generation(format!("{err:#}"))),
        };

        let max = self.settings.max_fix_attempts.max(1);
        let mut last_failure = String::new();
        for n in 1..=max {
            if self.cancel.is_cancelled() {
                apply_generated(&mut attempt.record, &current);
                return attempt.fail(NodeFailure::Cancelled);
            }
            let result = match self.run_sandbox(attempt.job, &current.code) {
                Ok(result) => result,
                Err(failure) => {
                    apply_generated(&mut attempt.record, &current);
                    return attempt.fail(failure);
                }
            };
            attempt.record.total_attempts = n;
            apply_generated(&mut attempt.record, &current);
            record_run(&mut attempt.record, &result, &attempt.job.output_prefix);

            let ok = result.succeeded(self.settings.treat_stderr_as_failure);
            self.emit(
                attempt.job,
                EventKind::SandboxRun,
                run_summary(&result, ok),
                Some(n),
            );
            // A deadline-clamped timeout is reported as cancellation.
            if result.cancelled || (!ok && self.cancel.is_cancelled()) {
                return attempt.fail(NodeFailure::Cancelled);
            }
            if ok {
                info!(attempts = n, "node code succeeded");
                return attempt.finish(NodeStatus::Completed);
            }

            last_failure = result.failure_report();
            warn!(attempt = n, max, timed_out = result.timed_out, "node code failed");
            if n < max {
                self.emit(
                    attempt.job,
                    EventKind::Repairing,
                    format!("repairing after attempt {n}/{max}"),
                    Some(n),
                );
                match self
                    .agent
                    .repair_code(&attempt.brief(), &current.code, &last_failure)
                {
                    Ok(fixed) if !fixed.is_empty() => current = fixed.inherit_narrative(&current),
                    Ok(_) => warn!("repair returned no code, retrying previous code"),
                    Err(err) => warn!(err = %format!("{err:#}"), "repair failed, retrying previous code"),
                }
            }
        }

        attempt.fail(NodeFailure::Runtime {
            attempts: max,
            last_failure,
        })
    }

    /// Run probes until the agent has enough information or rounds run out.
    ///
    /// Probe collaborator errors end gathering early; only a sandbox launch failure
    /// or cancellation fails the node.
    fn gather_info(&self, attempt: &mut Attempt<'_>) -> Result<(), NodeFailure> {
        for round in 1..=self.settings.max_info_rounds {
            if self.cancel.is_cancelled() {
                return Err(NodeFailure::Cancelled);
            }
            let code = match self.agent.probe(&attempt.brief()) {
                Ok(Some(code)) => code,
                Ok(None) => break,
                Err(err) => {
                    warn!(round, err = %format!("{err:#}"), "info probe failed, continuing without it");
                    break;
                }
            };
            attempt.record.info_gathering_rounds = round;
            let section = match self.run_probe(attempt, code)? {
                ProbeOutcome::Output(output) => {
                    format!("## Probe {round}\n{}", output.trim_end())
                }
                ProbeOutcome::Failed(report) => {
                    format!("## Probe {round} (failed)\n{}", report.trim_end())
                }
                ProbeOutcome::Cancelled => return Err(NodeFailure::Cancelled),
            };
            if !attempt.gathered.is_empty() {
                attempt.gathered.push_str("\n\n");
            }
            attempt.gathered.push_str(&section);
            self.emit(
                attempt.job,
                EventKind::InfoGathered,
                format!("probe round {round} finished"),
                Some(round),
            );
        }
        Ok(())
    }

    fn run_probe(&self, attempt: &Attempt<'_>, mut code: String) -> Result<ProbeOutcome, NodeFailure> {
        let max = self.settings.max_info_fix_attempts.max(1);
        let mut last_failure = String::new();
        for n in 1..=max {
            let result = self.run_sandbox(attempt.job, &code)?;
            let ok = result.succeeded(self.settings.treat_stderr_as_failure);
            if result.cancelled || (!ok && self.cancel.is_cancelled()) {
                return Ok(ProbeOutcome::Cancelled);
            }
            if ok {
                return Ok(ProbeOutcome::Output(result.stdout));
            }
            last_failure = result.failure_report();
            if n < max {
                match self
                    .agent
                    .repair_probe(&attempt.brief(), &code, &last_failure)
                {
                    Ok(fixed) if !fixed.trim().is_empty() => code = fixed,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(err = %format!("{err:#}"), "probe repair failed");
                        break;
                    }
                }
            }
        }
        Ok(ProbeOutcome::Failed(last_failure))
    }

    fn run_sandbox(&self, job: &NodeJob, code: &str) -> Result<SandboxResult, NodeFailure> {
        let request = SandboxRequest {
            code: code.to_string(),
            workspace: job.workspace.clone(),
            data_dir: self.settings.data_dir.clone(),
            memory_mb: self.settings.memory_mb,
            network_disabled: self.settings.network_disabled,
            timeout: effective_timeout(self.settings.sandbox_timeout, self.cancel.deadline()),
        };
        self.sandbox.run(&request, self.cancel).map_err(|err| {
            match err.downcast_ref::<SandboxError>() {
                Some(launch) => NodeFailure::SandboxLaunch(launch.to_string()),
                None => NodeFailure::SandboxLaunch(format!("sandbox failed: {err:#}")),
            }
        })
    }

    fn emit(&self, job: &NodeJob, kind: EventKind, message: String, attempt: Option<u32>) {
        let mut event = ProgressEvent::node(&job.plan_id, &job.node.id, kind, message)
            .with_status(NodeStatus::Running);
        event.attempt = attempt;
        self.events.emit(&event);
    }
}

fn apply_generated(record: &mut NodeExecutionRecord, generated: &GeneratedCode) {
    record.code = Some(generated.code.clone());
    record.code_description = non_blank(&generated.description);
    record.has_visualization = generated.has_visualization;
    record.visualization_purpose = generated
        .visualization_purpose
        .as_deref()
        .and_then(non_blank);
    record.visualization_analysis = generated
        .visualization_analysis
        .as_deref()
        .and_then(non_blank);
}

fn record_run(record: &mut NodeExecutionRecord, result: &SandboxResult, prefix: &str) {
    record.code_output = Some(result.stdout.clone());
    record.code_error = non_blank(&result.stderr);
    record.timed_out = result.timed_out;
    for file in &result.generated_files {
        let path = output_relative(prefix, file);
        if !record.generated_files.contains(&path) {
            record.generated_files.push(path);
        }
    }
}

fn output_relative(prefix: &str, file: &Path) -> String {
    let relative = file
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        relative
    } else {
        format!("{}/{relative}", prefix.trim_end_matches('/'))
    }
}

fn run_summary(result: &SandboxResult, ok: bool) -> String {
    if ok {
        return "code succeeded".to_string();
    }
    if result.timed_out {
        return "code timed out".to_string();
    }
    match result.exit_code {
        Some(code) => format!("code exited with {code}"),
        None => "code was killed".to_string(),
    }
}

fn non_blank(text: &str) -> Option<String> {
    (!text.trim().is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        RecordingSink, ScriptedAgent, ScriptedSandbox, atomic, failing_run, ok_run,
    };

    fn settings() -> ExecutorSettings {
        let mut settings = ExecutorSettings::from_config(&EngineConfig::default(), None);
        settings.sandbox_timeout = Duration::from_secs(5);
        settings
    }

    fn job(node: PlanNode) -> NodeJob {
        NodeJob {
            plan_id: "plan".to_string(),
            output_prefix: format!("nodes/{}", node.id),
            workspace: PathBuf::from("/unused"),
            context: NodeContext::default(),
            node,
        }
    }

    fn execute(
        agent: &dyn Agent,
        sandbox: &ScriptedSandbox,
        settings: &ExecutorSettings,
        job: &NodeJob,
    ) -> (NodeExecutionRecord, RecordingSink) {
        let events = RecordingSink::default();
        let cancel = CancelToken::new();
        let record = TaskExecutor {
            agent,
            sandbox,
            settings,
            events: &events,
            cancel: &cancel,
        }
        .execute(job);
        (record, events)
    }

    #[test]
    fn text_only_node_is_answered_without_sandbox() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::TextOnly)
            .answer("A p-value is a probability.");
        let sandbox = ScriptedSandbox::new();
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("q")));

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.task_type, Some(TaskType::TextOnly));
        assert_eq!(
            record.text_response.as_deref(),
            Some("A p-value is a probability.")
        );
        assert_eq!(record.total_attempts, 0);
        assert_eq!(sandbox.calls(), 0);
    }

    #[test]
    fn repaired_on_second_attempt() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("print(undefined)")
            .repair("print(42)");
        let sandbox = ScriptedSandbox::new()
            .then(failing_run(1, "NameError: undefined"))
            .then(ok_run("42\n"));
        let (record, events) = execute(&agent, &sandbox, &settings(), &job(atomic("calc")));

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.total_attempts, 2);
        assert_eq!(record.code.as_deref(), Some("print(42)"));
        assert_eq!(record.code_output.as_deref(), Some("42\n"));
        assert!(record.error_message.is_none());
        let failures = agent.repair_failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("Exit Code: 1"));
        assert!(failures[0].contains("NameError"));
        assert_eq!(events.count(EventKind::SandboxRun), 2);
        assert_eq!(events.count(EventKind::Repairing), 1);
    }

    #[test]
    fn repair_without_chart_fields_keeps_visualization_narrative() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("plot(undefined)")
            .visualization("Compare regional totals", "North leads with 42")
            .repair("plot(totals)");
        let sandbox = ScriptedSandbox::new()
            .then(failing_run(1, "NameError: undefined"))
            .then(ok_run("saved\n"));
        let mut node = atomic("chart");
        node.visualization = true;
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(node));

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.total_attempts, 2);
        assert_eq!(record.code.as_deref(), Some("plot(totals)"));
        assert!(record.has_visualization);
        assert_eq!(
            record.visualization_purpose.as_deref(),
            Some("Compare regional totals")
        );
        assert_eq!(
            record.visualization_analysis.as_deref(),
            Some("North leads with 42")
        );
    }

    #[cfg(unix)]
    #[test]
    fn classifier_answer_outside_known_types_fails_node() {
        use crate::io::command_agent::CommandAgent;
        use crate::io::config::AgentConfig;

        let agent = CommandAgent::from_config(&AgentConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"task_type": "banana"}'"#.to_string(),
            ],
            timeout_secs: 10,
            output_limit_bytes: 64 * 1024,
        });
        let sandbox = ScriptedSandbox::new();
        let (record, events) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.task_type, None);
        assert_eq!(record.total_attempts, 0);
        assert_eq!(sandbox.calls(), 0);
        assert_eq!(events.count(EventKind::Classified), 0);
        let message = record.error_message.expect("message");
        assert!(message.starts_with("classification failed"), "{message}");
        assert!(message.contains("banana"), "{message}");
    }

    #[test]
    fn exhausting_attempts_fails_with_last_error() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("boom()");
        let sandbox = ScriptedSandbox::new().always(failing_run(1, "ZeroDivisionError"));
        let mut settings = settings();
        settings.max_fix_attempts = 3;
        let (record, _) = execute(&agent, &sandbox, &settings, &job(atomic("calc")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.total_attempts, 3);
        assert_eq!(sandbox.calls(), 3);
        assert_eq!(record.code_error.as_deref(), Some("ZeroDivisionError"));
        let message = record.error_message.expect("error message");
        assert!(message.contains("after 3 attempt(s)"));
        assert!(message.contains("ZeroDivisionError"));
    }

    #[test]
    fn classification_error_consumes_no_attempts() {
        let agent = ScriptedAgent::new().classify_error("model unavailable");
        let sandbox = ScriptedSandbox::new();
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.task_type, None);
        assert_eq!(record.total_attempts, 0);
        assert!(
            record
                .error_message
                .expect("message")
                .starts_with("classification failed: model unavailable")
        );
    }

    #[test]
    fn generation_error_consumes_no_attempts() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code_error("context too long");
        let sandbox = ScriptedSandbox::new();
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.task_type, Some(TaskType::CodeRequired));
        assert_eq!(record.total_attempts, 0);
        assert_eq!(sandbox.calls(), 0);
        assert!(
            record
                .error_message
                .expect("message")
                .contains("context too long")
        );
    }

    #[test]
    fn forced_type_skips_classifier() {
        let agent = ScriptedAgent::new().classify_error("must not be called").code("print(1)");
        let sandbox = ScriptedSandbox::new().then(ok_run("1\n"));
        let mut node = atomic("a");
        node.task_type = Some(TaskType::CodeRequired);
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(node));
        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(agent.classify_calls(), 0);
    }

    #[test]
    fn probes_feed_gathered_info_and_do_not_count_as_attempts() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .probe_code("print(df.shape)")
            .code("print('done')");
        let sandbox = ScriptedSandbox::new()
            .then(ok_run("(10, 3)\n"))
            .then(ok_run("done\n"));
        let (record, events) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.info_gathering_rounds, 1);
        assert_eq!(record.total_attempts, 1);
        assert!(record.gathered_info.expect("gathered").contains("(10, 3)"));
        assert_eq!(events.count(EventKind::InfoGathered), 1);
        assert!(agent.generation_briefs()[0].contains("(10, 3)"));
    }

    #[test]
    fn failing_probe_is_repaired_within_its_own_bound() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .probe_code("bad()")
            .probe_repair("print('ok')")
            .code("print('main')");
        let sandbox = ScriptedSandbox::new()
            .then(failing_run(1, "NameError"))
            .then(ok_run("probe ok\n"))
            .then(ok_run("main\n"));
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.total_attempts, 1);
        assert_eq!(sandbox.calls(), 3);
        assert!(record.gathered_info.expect("gathered").contains("probe ok"));
    }

    #[test]
    fn timeout_is_flagged_and_reported_to_repair() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("while True: pass");
        let mut timed_out = failing_run(-1, "");
        timed_out.exit_code = None;
        timed_out.timed_out = true;
        let sandbox = ScriptedSandbox::new().always(timed_out);
        let mut settings = settings();
        settings.max_fix_attempts = 2;
        let (record, _) = execute(&agent, &sandbox, &settings, &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert!(record.timed_out);
        assert!(agent.repair_failures()[0].contains("Timed out"));
    }

    #[test]
    fn launch_failure_is_terminal() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("print(1)");
        let sandbox = ScriptedSandbox::new().launch_error("docker daemon not running");
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.total_attempts, 0);
        assert_eq!(sandbox.calls(), 1);
        assert!(
            record
                .error_message
                .expect("message")
                .contains("docker daemon not running")
        );
    }

    #[test]
    fn generated_files_are_prefixed_and_deduplicated() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::CodeRequired)
            .code("plot()")
            .repair("plot()")
            .visualization("Show trend", "Upward trend");
        let mut first = failing_run(1, "err");
        first.generated_files = vec![PathBuf::from("results/a.png")];
        let mut second = ok_run("");
        second.generated_files = vec![
            PathBuf::from("results/a.png"),
            PathBuf::from("results/b.csv"),
        ];
        let sandbox = ScriptedSandbox::new().then(first).then(second);
        let (record, _) = execute(&agent, &sandbox, &settings(), &job(atomic("viz")));

        assert_eq!(
            record.generated_files,
            vec![
                "nodes/viz/results/a.png".to_string(),
                "nodes/viz/results/b.csv".to_string()
            ]
        );
        assert!(record.has_visualization);
        assert_eq!(record.visualization_purpose.as_deref(), Some("Show trend"));
    }

    #[test]
    fn unmet_dependencies_are_recorded_as_warning() {
        let agent = ScriptedAgent::new()
            .classify_as(TaskType::TextOnly)
            .answer("partial answer");
        let sandbox = ScriptedSandbox::new();
        let mut job = job(atomic("d"));
        job.context = NodeContext {
            text: "### Dependency: e title (e) [failed] UNMET DEPENDENCY".to_string(),
            unmet: vec!["e".to_string()],
        };
        let (record, _) = execute(&agent, &sandbox, &settings(), &job);

        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.unmet_dependencies, vec!["e".to_string()]);
        assert!(
            record
                .gathered_info
                .expect("warning")
                .contains("UNMET DEPENDENCY")
        );
    }

    #[test]
    fn cancelled_before_start_fails_without_work() {
        let agent = ScriptedAgent::new().classify_as(TaskType::CodeRequired);
        let sandbox = ScriptedSandbox::new();
        let settings = settings();
        let events = RecordingSink::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let record = TaskExecutor {
            agent: &agent,
            sandbox: &sandbox,
            settings: &settings,
            events: &events,
            cancel: &cancel,
        }
        .execute(&job(atomic("a")));

        assert_eq!(record.status, NodeStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("cancelled"));
        assert_eq!(agent.classify_calls(), 0);
    }
}

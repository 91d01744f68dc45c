//! Orchestration for `planrun run`: wires config-built collaborators into the scheduler.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::cancel::CancelToken;
use crate::core::types::{PlanExecutionResult, TaskType};
use crate::executor::ExecutorSettings;
use crate::io::agent::Agent;
use crate::io::command_agent::CommandAgent;
use crate::io::config::{EngineConfig, load_config};
use crate::io::data_files::summarize_data_dir;
use crate::io::events::{ConsoleSink, EventSink, FanoutSink, JsonlEventSink};
use crate::io::init::PlanrunPaths;
use crate::io::sandbox::{Sandbox, sandbox_from_config};
use crate::io::store::FilePlanStore;
use crate::scheduler::Scheduler;

/// Parameters of one `planrun run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub plan_id: String,
    /// Overrides `workers` from config.
    pub workers: Option<usize>,
    pub force_task_type: Option<TaskType>,
    /// Print node transitions to stderr.
    pub progress: bool,
}

/// Run a stored plan with the agent command and sandbox backend from config.
pub fn run_plan(root: &Path, request: &RunRequest) -> Result<PlanExecutionResult> {
    let paths = PlanrunPaths::new(root);
    let cfg = load_config(&paths.config_path).context("load config.toml")?;
    let cancel = match cfg.plan_timeout() {
        Some(budget) => {
            debug!(budget_secs = budget.as_secs(), "plan deadline set");
            CancelToken::with_deadline(Instant::now() + budget)
        }
        None => CancelToken::new(),
    };
    let agent = CommandAgent::from_config(&cfg.agent).with_cancel(cancel.clone());
    let sandbox = sandbox_from_config(&cfg.sandbox);
    run_plan_with(root, &cfg, request, &agent, sandbox.as_ref(), cancel)
}

/// Run a stored plan with explicit collaborators.
pub fn run_plan_with(
    root: &Path,
    cfg: &EngineConfig,
    request: &RunRequest,
    agent: &dyn Agent,
    sandbox: &dyn Sandbox,
    cancel: CancelToken,
) -> Result<PlanExecutionResult> {
    let store = FilePlanStore::new(root);
    let plan_paths = store.paths().plan(&request.plan_id);
    if !plan_paths.plan_path.exists() {
        return Err(anyhow!(
            "unknown plan '{}' (import it with `planrun import`)",
            request.plan_id
        ));
    }
    let workers = request.workers.unwrap_or(cfg.workers);
    if workers == 0 {
        return Err(anyhow!("--workers must be > 0"));
    }

    let mut sinks: Vec<Box<dyn EventSink>> =
        vec![Box::new(JsonlEventSink::open(&plan_paths.events_path)?)];
    if request.progress {
        sinks.push(Box::new(ConsoleSink));
    }
    let events = FanoutSink::new(sinks);

    let mut settings = ExecutorSettings::from_config(cfg, request.force_task_type);
    settings.data_dir = settings
        .data_dir
        .map(|dir| if dir.is_relative() { root.join(dir) } else { dir });
    if let Some(dir) = settings.data_dir.as_deref() {
        if cfg.data_summary_limit_chars > 0 {
            settings.data_summary = match summarize_data_dir(dir, cfg.data_summary_limit_chars) {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "data directory summary unavailable");
                    String::new()
                }
            };
        }
    }

    info!(plan_id = %request.plan_id, workers, "starting plan run");
    Scheduler {
        store: &store,
        agent,
        sandbox,
        events: &events,
        settings: &settings,
        output_dir: plan_paths.output_dir,
        workers,
        context_limit_chars: cfg.context_output_limit_chars,
        cancel,
    }
    .run(&request.plan_id)
}

//! Graph scheduler: dispatches eligible nodes to a bounded worker pool.
//!
//! The scheduler thread is the only writer of node state. Workers run the task
//! executor on a cloned node and send the finished record back over a channel;
//! the scheduler persists it, feeds the report, and recomputes eligibility.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::context::build_node_context;
use crate::core::graph::PlanGraph;
use crate::core::types::{NodeExecutionRecord, PlanExecutionResult, RunStats};
use crate::executor::{ExecutorSettings, NodeJob, TaskExecutor};
use crate::io::agent::Agent;
use crate::io::events::{EventKind, EventSink, ProgressEvent};
use crate::io::report::ReportAggregator;
use crate::io::sandbox::Sandbox;
use crate::io::store::PlanStore;
use crate::plan::{NodeStatus, Plan};

pub const CANCELLED_REASON: &str = "plan cancelled";

/// Run-aborting failures. Node-level failures are never reported here.
#[derive(Debug)]
pub enum SchedulerError {
    /// Nothing is eligible or in flight, yet nodes remain pending.
    Stalled { pending: Vec<String> },
    /// Node state could not be persisted.
    Store { node_id: String, source: anyhow::Error },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Stalled { pending } => write!(
                f,
                "scheduler stalled with pending nodes: {}",
                pending.join(", ")
            ),
            SchedulerError::Store { node_id, source } => {
                write!(f, "failed to persist node '{node_id}': {source:#}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Collaborators and limits for one run.
pub struct Scheduler<'a> {
    pub store: &'a dyn PlanStore,
    pub agent: &'a dyn Agent,
    pub sandbox: &'a dyn Sandbox,
    pub events: &'a dyn EventSink,
    pub settings: &'a ExecutorSettings,
    /// Plan output directory; node scratch mounts and the report live here.
    pub output_dir: PathBuf,
    pub workers: usize,
    pub context_limit_chars: usize,
    pub cancel: CancelToken,
}

/// Node state owned by the scheduler thread during a run.
struct RunState {
    plan: Plan,
    graph: PlanGraph,
    statuses: Vec<NodeStatus>,
    report: Option<ReportAggregator>,
    cancelled: bool,
}

impl Scheduler<'_> {
    /// Execute every runnable node of `plan_id` and return the run summary.
    ///
    /// Terminal nodes from earlier runs are kept as-is; nodes left `running` by an
    /// interrupted process start over.
    #[instrument(skip_all, fields(plan_id = %plan_id, workers = self.workers))]
    pub fn run(&self, plan_id: &str) -> Result<PlanExecutionResult> {
        let mut plan = self
            .store
            .load_plan(plan_id)
            .with_context(|| format!("load plan '{plan_id}'"))?;
        let started_at = Utc::now();
        self.emit(ProgressEvent::plan(
            plan_id,
            EventKind::RunStarted,
            format!("running {} nodes", plan.nodes.len()),
        ));

        for node in &mut plan.nodes {
            if node.status == NodeStatus::Running {
                warn!(node_id = %node.id, "node was interrupted by an earlier run, restarting it");
                self.persist(plan_id, &node.id, NodeStatus::Pending, None)?;
                node.status = NodeStatus::Pending;
                node.execution_result = None;
            }
        }

        let report = match ReportAggregator::create(&self.output_dir, &plan.id, &plan.title, started_at)
        {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "report disabled for this run");
                None
            }
        };
        let graph = PlanGraph::new(&plan);
        let statuses = plan.nodes.iter().map(|node| node.status).collect();
        let mut state = RunState {
            plan,
            graph,
            statuses,
            report,
            cancelled: false,
        };

        self.drive(&mut state)?;

        if state.cancelled {
            for i in 0..state.graph.len() {
                if state.statuses[i] == NodeStatus::Pending {
                    self.skip(&mut state, i, CANCELLED_REASON)?;
                }
            }
        }

        let pending: Vec<String> = (0..state.graph.len())
            .filter(|&i| !state.statuses[i].is_terminal())
            .map(|i| state.graph.id(i).to_string())
            .collect();
        if !pending.is_empty() {
            for &i in &state.graph.blocked_pending(&state.statuses) {
                error!(node_id = %state.graph.id(i), "pending node was never skipped");
            }
            return Err(SchedulerError::Stalled { pending }.into());
        }

        Ok(self.finish(state, started_at))
    }

    /// Dispatch loop; returns once nothing is eligible and nothing is in flight.
    fn drive(&self, state: &mut RunState) -> Result<()> {
        let workers = self.workers.max(1);
        let (tx, rx) = mpsc::channel::<(usize, NodeExecutionRecord)>();

        thread::scope(|scope| -> Result<()> {
            let mut in_flight = 0usize;
            loop {
                for i in state.graph.blocked_pending(&state.statuses) {
                    let reason = state
                        .graph
                        .blocker(i)
                        .map(|blocker| blocker.reason())
                        .unwrap_or_default();
                    warn!(node_id = %state.graph.id(i), reason = %reason, "skipping node");
                    self.skip(state, i, &reason)?;
                }

                if !state.cancelled && self.cancel.is_cancelled() {
                    state.cancelled = true;
                    info!(in_flight, "run cancelled, waiting for in-flight nodes");
                    self.emit(ProgressEvent::plan(
                        &state.plan.id,
                        EventKind::RunCancelled,
                        CANCELLED_REASON,
                    ));
                }

                if !state.cancelled {
                    for i in state.graph.eligible(&state.statuses) {
                        if in_flight >= workers {
                            break;
                        }
                        let job = self.start(state, i)?;
                        let tx = tx.clone();
                        scope.spawn(move || {
                            let record = self.execute(&job);
                            let _ = tx.send((i, record));
                        });
                        in_flight += 1;
                    }
                }

                if in_flight == 0 {
                    return Ok(());
                }
                let (i, record) = rx
                    .recv()
                    .map_err(|_| anyhow!("worker channel closed with nodes in flight"))?;
                in_flight -= 1;
                self.complete(state, i, record)?;
            }
        })
    }

    /// Mark node `i` running and build its job.
    fn start(&self, state: &mut RunState, i: usize) -> Result<NodeJob> {
        let context = build_node_context(&state.plan, &state.graph, i, self.context_limit_chars);
        let node = &mut state.plan.nodes[i];
        self.persist(&state.plan.id, &node.id, NodeStatus::Running, None)?;
        node.status = NodeStatus::Running;
        state.statuses[i] = NodeStatus::Running;
        debug!(node_id = %node.id, unmet = context.unmet.len(), "dispatching node");
        self.emit(
            ProgressEvent::node(&state.plan.id, &node.id, EventKind::NodeStarted, "started")
                .with_status(NodeStatus::Running),
        );
        Ok(NodeJob {
            plan_id: state.plan.id.clone(),
            workspace: self.output_dir.join("nodes").join(&node.id),
            output_prefix: format!("nodes/{}", node.id),
            node: node.clone(),
            context,
        })
    }

    fn execute(&self, job: &NodeJob) -> NodeExecutionRecord {
        let executor = TaskExecutor {
            agent: self.agent,
            sandbox: self.sandbox,
            settings: self.settings,
            events: self.events,
            cancel: &self.cancel,
        };
        panic::catch_unwind(AssertUnwindSafe(|| executor.execute(job))).unwrap_or_else(|_| {
            let mut record = NodeExecutionRecord::new(NodeStatus::Failed, Utc::now());
            record.error_message = Some("executor panicked".to_string());
            record
        })
    }

    /// Persist a finished record and forward it to the report.
    fn complete(&self, state: &mut RunState, i: usize, record: NodeExecutionRecord) -> Result<()> {
        let status = match record.status {
            NodeStatus::Completed => NodeStatus::Completed,
            _ => NodeStatus::Failed,
        };
        let node = &mut state.plan.nodes[i];
        self.persist(&state.plan.id, &node.id, status, Some(&record))?;

        info!(
            node_id = %node.id,
            status = %status,
            attempts = record.total_attempts,
            "node finished"
        );
        let mut event = ProgressEvent::node(
            &state.plan.id,
            &node.id,
            EventKind::NodeFinished,
            record.error_message.clone().unwrap_or_else(|| "done".to_string()),
        )
        .with_status(status);
        if record.total_attempts > 0 {
            event = event.with_attempt(record.total_attempts);
        }
        self.emit(event);

        if status == NodeStatus::Completed {
            if let Some(report) = state.report.as_mut() {
                if let Err(err) = report.append(&node.id, &node.title, &record) {
                    warn!(node_id = %node.id, err = %format!("{err:#}"), "failed to append report section");
                }
            }
        }
        node.status = status;
        node.execution_result = Some(record);
        state.statuses[i] = status;
        Ok(())
    }

    fn skip(&self, state: &mut RunState, i: usize, reason: &str) -> Result<()> {
        let record = NodeExecutionRecord::skipped(reason, Utc::now());
        let node = &mut state.plan.nodes[i];
        self.persist(&state.plan.id, &node.id, NodeStatus::Skipped, Some(&record))?;
        self.emit(
            ProgressEvent::node(&state.plan.id, &node.id, EventKind::NodeSkipped, reason)
                .with_status(NodeStatus::Skipped),
        );
        node.status = NodeStatus::Skipped;
        node.execution_result = Some(record);
        state.statuses[i] = NodeStatus::Skipped;
        Ok(())
    }

    fn finish(&self, state: RunState, started_at: chrono::DateTime<Utc>) -> PlanExecutionResult {
        let stats = RunStats::from_statuses(state.statuses.iter().copied());
        let completed_at = Utc::now();
        let report_path = state.report.and_then(|report| {
            report
                .finalize(&stats, state.cancelled, completed_at)
                .map_err(|err| warn!(err = %format!("{err:#}"), "failed to finalize report"))
                .ok()
        });

        let mut records = BTreeMap::new();
        let mut generated_files = Vec::new();
        for node in state.plan.nodes {
            if let Some(record) = node.execution_result {
                for file in &record.generated_files {
                    if !generated_files.contains(file) {
                        generated_files.push(file.clone());
                    }
                }
                records.insert(node.id, record);
            }
        }

        self.emit(ProgressEvent::plan(
            &state.plan.id,
            EventKind::RunFinished,
            format!(
                "{} completed, {} failed, {} skipped",
                stats.completed, stats.failed, stats.skipped
            ),
        ));
        info!(
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            cancelled = state.cancelled,
            "run finished"
        );

        PlanExecutionResult {
            plan_id: state.plan.id,
            title: state.plan.title,
            total: stats.total,
            completed: stats.completed,
            failed: stats.failed,
            skipped: stats.skipped,
            cancelled: state.cancelled,
            records,
            generated_files,
            report_path,
            started_at,
            completed_at,
        }
    }

    /// Save node state; a failure cancels in-flight work and aborts the run.
    fn persist(
        &self,
        plan_id: &str,
        node_id: &str,
        status: NodeStatus,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<()> {
        self.store
            .save_status(plan_id, node_id, status, record)
            .map_err(|source| {
                self.cancel.cancel();
                SchedulerError::Store {
                    node_id: node_id.to_string(),
                    source,
                }
                .into()
            })
    }

    fn emit(&self, event: ProgressEvent) {
        self.events.emit(&event);
    }
}

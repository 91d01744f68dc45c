//! Test-only builders and scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::cancel::CancelToken;
use crate::core::types::{NodeExecutionRecord, TaskType};
use crate::io::agent::{Classifier, GeneratedCode, Generator, InfoProbe, TaskBrief};
use crate::io::events::{EventKind, EventSink, ProgressEvent};
use crate::io::sandbox::{Sandbox, SandboxError, SandboxRequest, SandboxResult};
use crate::io::store::PlanStore;
use crate::plan::{NodeKind, NodeStatus, Plan, PlanNode};

/// Plan with id `plan` holding `nodes` in order.
pub fn plan(nodes: Vec<PlanNode>) -> Plan {
    Plan {
        id: "plan".to_string(),
        title: "Test plan".to_string(),
        nodes,
    }
}

fn node(id: &str, kind: NodeKind) -> PlanNode {
    PlanNode {
        id: id.to_string(),
        title: format!("{id} title"),
        instruction: format!("{id} instruction"),
        kind,
        parent_id: None,
        dependencies: Vec::new(),
        task_type: None,
        visualization: false,
        status: NodeStatus::Pending,
        execution_result: None,
    }
}

pub fn root(id: &str) -> PlanNode {
    node(id, NodeKind::Root)
}

pub fn composite(id: &str) -> PlanNode {
    node(id, NodeKind::Composite)
}

pub fn atomic(id: &str) -> PlanNode {
    node(id, NodeKind::Atomic)
}

impl PlanNode {
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_id = Some(parent.to_string());
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }
}

/// Successful sandbox result printing `stdout`.
pub fn ok_run(stdout: &str) -> SandboxResult {
    SandboxResult {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: false,
        cancelled: false,
        generated_files: Vec::new(),
        duration: Duration::from_millis(5),
        stdout_truncated: 0,
        stderr_truncated: 0,
    }
}

/// Sandbox result that exited with `code` and wrote `stderr`.
pub fn failing_run(code: i32, stderr: &str) -> SandboxResult {
    SandboxResult {
        exit_code: Some(code),
        stderr: stderr.to_string(),
        ..ok_run("")
    }
}

/// Behaviour of [`ScriptedAgent`] for one node (or every node by default).
#[derive(Debug, Clone, Default)]
pub struct AgentScript {
    task_type: Option<std::result::Result<TaskType, String>>,
    answer: Option<String>,
    code: Option<std::result::Result<String, String>>,
    repairs: Vec<String>,
    probes: Vec<String>,
    probe_repairs: Vec<String>,
    visualization: Option<(String, String)>,
    delay: Option<Duration>,
}

/// Agent answering from a fixed script and recording what it was asked.
///
/// Unscripted nodes are classified `text_only` and answered with
/// `"<id> answer"`.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    default: AgentScript,
    nodes: HashMap<String, AgentScript>,
    cancel_on: HashMap<String, CancelToken>,
    counters: Mutex<HashMap<(String, &'static str), usize>>,
    classify_calls: AtomicUsize,
    repair_failures: Mutex<Vec<String>>,
    briefs: Mutex<Vec<(String, String, String)>>,
    data_summaries: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify_as(mut self, task_type: TaskType) -> Self {
        self.default.task_type = Some(Ok(task_type));
        self
    }

    pub fn classify_error(mut self, reason: &str) -> Self {
        self.default.task_type = Some(Err(reason.to_string()));
        self
    }

    pub fn answer(mut self, answer: &str) -> Self {
        self.default.answer = Some(answer.to_string());
        self
    }

    pub fn code(mut self, code: &str) -> Self {
        self.default.code = Some(Ok(code.to_string()));
        self
    }

    pub fn code_error(mut self, reason: &str) -> Self {
        self.default.code = Some(Err(reason.to_string()));
        self
    }

    /// Queue a repair; the last queued repair is repeated once the queue runs out.
    pub fn repair(mut self, code: &str) -> Self {
        self.default.repairs.push(code.to_string());
        self
    }

    /// Queue a probe; `probe` returns `None` once every queued probe was handed out.
    pub fn probe_code(mut self, code: &str) -> Self {
        self.default.probes.push(code.to_string());
        self
    }

    pub fn probe_repair(mut self, code: &str) -> Self {
        self.default.probe_repairs.push(code.to_string());
        self
    }

    pub fn visualization(mut self, purpose: &str, analysis: &str) -> Self {
        self.default.visualization = Some((purpose.to_string(), analysis.to_string()));
        self
    }

    /// Sleep inside every generation call.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.default.delay = Some(delay);
        self
    }

    /// Use `script`'s defaults for node `id`.
    pub fn for_node(mut self, id: &str, script: ScriptedAgent) -> Self {
        self.nodes.insert(id.to_string(), script.default);
        self
    }

    /// Cancel `token` when node `id` asks for generation.
    pub fn cancel_during(mut self, id: &str, token: CancelToken) -> Self {
        self.cancel_on.insert(id.to_string(), token);
        self
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn repair_failures(&self) -> Vec<String> {
        lock(&self.repair_failures).clone()
    }

    /// Context and gathered info of every generation call, joined by a newline.
    pub fn generation_briefs(&self) -> Vec<String> {
        lock(&self.briefs)
            .iter()
            .map(|(_, context, gathered)| format!("{context}\n{gathered}"))
            .collect()
    }

    /// Context handed to the first generation call for `id`.
    pub fn context_for(&self, id: &str) -> Option<String> {
        lock(&self.briefs)
            .iter()
            .find(|(node, _, _)| node == id)
            .map(|(_, context, _)| context.clone())
    }

    /// Data summaries seen by classification and generation calls, in call order.
    pub fn data_summaries(&self) -> Vec<String> {
        lock(&self.data_summaries).clone()
    }

    /// Highest number of generation calls observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script(&self, id: &str) -> &AgentScript {
        self.nodes.get(id).unwrap_or(&self.default)
    }

    fn next(&self, id: &str, what: &'static str) -> usize {
        let mut counters = lock(&self.counters);
        let count = counters.entry((id.to_string(), what)).or_insert(0);
        *count += 1;
        *count - 1
    }

    fn generation<T>(&self, brief: &TaskBrief<'_>, f: impl FnOnce(&AgentScript) -> T) -> T {
        lock(&self.briefs).push((
            brief.node_id.to_string(),
            brief.context.to_string(),
            brief.gathered_info.to_string(),
        ));
        lock(&self.data_summaries).push(brief.data_summary.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let script = self.script(brief.node_id);
        if let Some(delay) = script.delay {
            thread::sleep(delay);
        }
        if let Some(token) = self.cancel_on.get(brief.node_id) {
            token.cancel();
        }
        let out = f(script);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn generated(script: &AgentScript, code: String) -> GeneratedCode {
        let mut generated = GeneratedCode {
            code,
            description: "scripted".to_string(),
            ..GeneratedCode::default()
        };
        if let Some((purpose, analysis)) = &script.visualization {
            generated.has_visualization = true;
            generated.visualization_purpose = Some(purpose.clone());
            generated.visualization_analysis = Some(analysis.clone());
        }
        generated
    }
}

impl Classifier for ScriptedAgent {
    fn classify(&self, brief: &TaskBrief<'_>) -> Result<TaskType> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.data_summaries).push(brief.data_summary.to_string());
        match &self.script(brief.node_id).task_type {
            Some(Ok(task_type)) => Ok(*task_type),
            Some(Err(reason)) => Err(anyhow!("{reason}")),
            None => Ok(TaskType::TextOnly),
        }
    }
}

impl Generator for ScriptedAgent {
    fn generate_code(&self, brief: &TaskBrief<'_>) -> Result<GeneratedCode> {
        self.generation(brief, |script| match &script.code {
            Some(Ok(code)) => Ok(Self::generated(script, code.clone())),
            Some(Err(reason)) => Err(anyhow!("{reason}")),
            None => Ok(Self::generated(
                script,
                format!("print('{}')", brief.node_id),
            )),
        })
    }

    fn generate_answer(&self, brief: &TaskBrief<'_>) -> Result<String> {
        self.generation(brief, |script| {
            Ok(script
                .answer
                .clone()
                .unwrap_or_else(|| format!("{} answer", brief.node_id)))
        })
    }

    fn repair_code(
        &self,
        brief: &TaskBrief<'_>,
        code: &str,
        failure: &str,
    ) -> Result<GeneratedCode> {
        lock(&self.repair_failures).push(failure.to_string());
        let script = self.script(brief.node_id);
        let n = self.next(brief.node_id, "repair");
        let fixed = script
            .repairs
            .get(n)
            .or(script.repairs.last())
            .cloned()
            .unwrap_or_else(|| code.to_string());
        // Repairs carry code only, like an agent answering the repair prompt.
        Ok(GeneratedCode {
            code: fixed,
            ..GeneratedCode::default()
        })
    }
}

impl InfoProbe for ScriptedAgent {
    fn probe(&self, brief: &TaskBrief<'_>) -> Result<Option<String>> {
        let n = self.next(brief.node_id, "probe");
        Ok(self.script(brief.node_id).probes.get(n).cloned())
    }

    fn repair_probe(&self, brief: &TaskBrief<'_>, code: &str, _failure: &str) -> Result<String> {
        let script = self.script(brief.node_id);
        let n = self.next(brief.node_id, "probe_repair");
        Ok(script
            .probe_repairs
            .get(n)
            .or(script.probe_repairs.last())
            .cloned()
            .unwrap_or_else(|| code.to_string()))
    }
}

/// Sandbox replaying queued results in call order.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    queue: Mutex<VecDeque<SandboxResult>>,
    fallback: Option<SandboxResult>,
    launch_error: Option<String>,
    requests: Mutex<Vec<SandboxRequest>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, result: SandboxResult) -> Self {
        lock(&self.queue).push_back(result);
        self
    }

    /// Result returned once the queue is empty (default: `ok_run("")`).
    pub fn always(mut self, result: SandboxResult) -> Self {
        self.fallback = Some(result);
        self
    }

    /// Fail every call with a launch error.
    pub fn launch_error(mut self, reason: &str) -> Self {
        self.launch_error = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<SandboxRequest> {
        lock(&self.requests).clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(&self, request: &SandboxRequest, cancel: &CancelToken) -> Result<SandboxResult> {
        lock(&self.requests).push(request.clone());
        if let Some(reason) = &self.launch_error {
            return Err(SandboxError::Launch {
                backend: "scripted",
                reason: reason.clone(),
            }
            .into());
        }
        let mut result = lock(&self.queue)
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| ok_run(""));
        if cancel.is_cancelled() {
            result.cancelled = true;
            result.exit_code = None;
        }
        Ok(result)
    }
}

/// In-memory plan store recording every save.
#[derive(Debug)]
pub struct MemoryStore {
    plan: Mutex<Plan>,
    saves: Mutex<Vec<(String, NodeStatus)>>,
    fail_on: Option<(String, NodeStatus)>,
}

impl MemoryStore {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan: Mutex::new(plan),
            saves: Mutex::new(Vec::new()),
            fail_on: None,
        }
    }

    /// Fail the save of `status` for node `id`.
    pub fn fail_on(mut self, id: &str, status: NodeStatus) -> Self {
        self.fail_on = Some((id.to_string(), status));
        self
    }

    pub fn plan(&self) -> Plan {
        lock(&self.plan).clone()
    }

    pub fn saves(&self) -> Vec<(String, NodeStatus)> {
        lock(&self.saves).clone()
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        lock(&self.plan).node(id).map(|node| node.status)
    }

    pub fn record(&self, id: &str) -> Option<NodeExecutionRecord> {
        lock(&self.plan)
            .node(id)
            .and_then(|node| node.execution_result.clone())
    }
}

impl PlanStore for MemoryStore {
    fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        let plan = lock(&self.plan).clone();
        if plan.id != plan_id {
            return Err(anyhow!("unknown plan '{plan_id}'"));
        }
        Ok(plan)
    }

    fn save_status(
        &self,
        _plan_id: &str,
        node_id: &str,
        status: NodeStatus,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<()> {
        if self
            .fail_on
            .as_ref()
            .is_some_and(|(id, s)| id == node_id && *s == status)
        {
            return Err(anyhow!("disk full"));
        }
        let mut plan = lock(&self.plan);
        let node = plan
            .node_mut(node_id)
            .ok_or_else(|| anyhow!("unknown node '{node_id}'"))?;
        node.status = status;
        node.execution_result = record.cloned();
        lock(&self.saves).push((node_id.to_string(), status));
        Ok(())
    }
}

/// Sink keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    /// Node ids of `kind` events, in emission order.
    pub fn nodes(&self, kind: EventKind) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter(|event| event.kind == kind)
            .filter_map(|event| event.node_id.clone())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &ProgressEvent) {
        lock(&self.events).push(event.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

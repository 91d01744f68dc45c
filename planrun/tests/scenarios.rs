//! End-to-end plan runs against the file store and a real `sh` process sandbox.
//!
//! Collaborators are scripted; everything else (persistence, scratch mounts, file
//! diffing, events, report) is the production code path.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use planrun::core::cancel::CancelToken;
use planrun::core::types::{NodeExecutionRecord, PlanExecutionResult, TaskType};
use planrun::exit_codes;
use planrun::io::config::EngineConfig;
use planrun::io::events::{EventKind, read_events};
use planrun::io::sandbox::{ProcessSandbox, Sandbox};
use planrun::io::store::{FilePlanStore, PlanStore};
use planrun::plan::{NodeStatus, Plan};
use planrun::run::{RunRequest, run_plan_with};
use planrun::test_support::{ScriptedAgent, ScriptedSandbox, atomic, ok_run, plan, root};

struct Project {
    dir: tempfile::TempDir,
    cfg: EngineConfig,
}

impl Project {
    fn new(plan: &Plan) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        FilePlanStore::new(dir.path())
            .import_plan(plan, false)
            .expect("import");
        let mut cfg = EngineConfig::default();
        cfg.sandbox.timeout_secs = 10;
        Self { dir, cfg }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn store(&self) -> FilePlanStore {
        FilePlanStore::new(self.root())
    }

    fn run(&self, agent: &ScriptedAgent, sandbox: &dyn Sandbox) -> PlanExecutionResult {
        let request = RunRequest {
            plan_id: "plan".to_string(),
            ..RunRequest::default()
        };
        run_plan_with(
            self.root(),
            &self.cfg,
            &request,
            agent,
            sandbox,
            CancelToken::new(),
        )
        .expect("run")
    }

    fn record(&self, id: &str) -> NodeExecutionRecord {
        self.store()
            .load_plan("plan")
            .expect("load")
            .node(id)
            .and_then(|node| node.execution_result.clone())
            .expect("record")
    }

    fn started(&self) -> Vec<String> {
        let events_path = self.store().paths().plan("plan").events_path;
        read_events(&events_path)
            .expect("events")
            .into_iter()
            .filter(|event| event.kind == EventKind::NodeStarted)
            .filter_map(|event| event.node_id)
            .collect()
    }

    fn output_dir(&self) -> PathBuf {
        self.store().paths().plan("plan").output_dir
    }
}

fn sh() -> ProcessSandbox {
    ProcessSandbox::new(vec!["sh".to_string()], "main.sh", 64 * 1024)
}

fn code_node(code: &str) -> ScriptedAgent {
    ScriptedAgent::new()
        .classify_as(TaskType::CodeRequired)
        .code(code)
}

#[test]
fn chain_runs_children_before_parent_and_collects_chart() {
    let project = Project::new(&plan(vec![
        root("A"),
        atomic("B").with_parent("A"),
        atomic("C").with_parent("A").depends_on(&["B"]),
    ]));
    let agent = ScriptedAgent::new()
        .for_node("B", code_node("echo 42"))
        .for_node(
            "C",
            code_node("mkdir -p results\necho png > results/chart.png\necho plotted")
                .visualization("Plot the computed value", "A single bar at 42"),
        );
    let result = project.run(&agent, &sh());

    assert_eq!(project.started(), vec!["B", "C", "A"]);
    assert_eq!(result.completed, 3);
    assert!(result.success());
    assert!(
        result
            .generated_files
            .contains(&"nodes/C/results/chart.png".to_string())
    );
    assert!(
        project
            .output_dir()
            .join("nodes/C/results/chart.png")
            .is_file()
    );

    let c = project.record("C");
    assert_eq!(c.code_output.as_deref(), Some("plotted\n"));
    assert!(agent.context_for("C").expect("context").contains("42"));
    let a_context = agent.context_for("A").expect("context");
    assert!(a_context.contains("42"));
    assert!(a_context.contains("plotted"));

    let report = fs::read_to_string(result.report_path.expect("report")).expect("read");
    assert!(report.contains("## C title (`C`)"));
    assert!(report.contains("![chart.png](nodes/C/results/chart.png)"));
    assert!(report.contains("A single bar at 42"));
}

#[test]
fn repaired_code_completes_on_second_attempt() {
    let project = Project::new(&plan(vec![atomic("calc")]));
    let agent = code_node("echo first >&2\nexit 1").repair("echo repaired");
    let result = project.run(&agent, &sh());

    assert_eq!(result.completed, 1);
    let record = project.record("calc");
    assert_eq!(record.status, NodeStatus::Completed);
    assert_eq!(record.total_attempts, 2);
    assert_eq!(record.code_output.as_deref(), Some("repaired\n"));
    assert_eq!(record.code.as_deref(), Some("echo repaired"));
    assert!(agent.repair_failures()[0].contains("Stderr: first"));
}

#[test]
fn code_that_never_works_fails_after_every_attempt() {
    let project = Project::new(&plan(vec![atomic("broken"), atomic("fine")]));
    let agent = ScriptedAgent::new().for_node("broken", code_node("echo nope >&2\nexit 3"));
    let result = project.run(&agent, &sh());

    assert_eq!(result.failed, 1);
    assert_eq!(result.completed, 1);
    assert_eq!(result.total, result.completed + result.failed + result.skipped);
    assert_eq!(exit_codes::for_run(&result), exit_codes::FAILED);

    let record = project.record("broken");
    assert_eq!(record.status, NodeStatus::Failed);
    assert_eq!(record.total_attempts, project.cfg.max_fix_attempts);
    assert_eq!(record.code_error.as_deref(), Some("nope\n"));
    assert!(
        !record
            .error_message
            .as_deref()
            .unwrap_or_default()
            .is_empty()
    );
}

#[test]
fn resume_only_runs_nodes_that_are_not_terminal() {
    let project = Project::new(&plan(vec![
        atomic("B"),
        atomic("C").depends_on(&["B"]),
    ]));
    let mut done = NodeExecutionRecord::new(NodeStatus::Completed, Utc::now());
    done.task_type = Some(TaskType::CodeRequired);
    done.code_output = Some("42\n".to_string());
    project
        .store()
        .save_status("plan", "B", NodeStatus::Completed, Some(&done))
        .expect("save");

    let agent = ScriptedAgent::new().classify_as(TaskType::CodeRequired);
    let sandbox = ScriptedSandbox::new().always(ok_run("84\n"));
    let result = project.run(&agent, &sandbox);

    assert_eq!(result.completed, 2);
    assert_eq!(project.started(), vec!["C"]);
    let workspaces: Vec<PathBuf> = sandbox
        .requests()
        .into_iter()
        .map(|request| request.workspace)
        .collect();
    assert_eq!(workspaces, vec![project.output_dir().join("nodes").join("C")]);
    assert_eq!(project.record("B"), done);
    assert!(agent.context_for("C").expect("context").contains("42"));
}

#[test]
fn downstream_of_failed_node_still_runs_with_warning() {
    let mut project = Project::new(&plan(vec![atomic("E"), atomic("D").depends_on(&["E"])]));
    project.cfg.max_fix_attempts = 2;
    let agent = ScriptedAgent::new()
        .for_node("E", code_node("echo partial\necho boom >&2\nexit 1"))
        .for_node(
            "D",
            ScriptedAgent::new()
                .classify_as(TaskType::TextOnly)
                .answer("summary despite missing input"),
        );
    let result = project.run(&agent, &sh());

    assert_eq!(result.failed, 1);
    assert_eq!(result.completed, 1);
    let d = project.record("D");
    assert_eq!(d.status, NodeStatus::Completed);
    assert_eq!(d.unmet_dependencies, vec!["E".to_string()]);
    assert!(
        d.gathered_info
            .as_deref()
            .unwrap_or_default()
            .contains("UNMET DEPENDENCY")
    );
    let context = agent.context_for("D").expect("context");
    assert!(context.contains("UNMET DEPENDENCY"));
    assert!(context.contains("partial"));
    assert!(d.started_at >= project.record("E").completed_at);
}

#[test]
fn data_directory_is_described_to_the_agent() {
    let mut project = Project::new(&plan(vec![atomic("load")]));
    let data = project.root().join("data");
    fs::create_dir_all(&data).expect("mkdir");
    fs::write(data.join("sales.csv"), "region,sales\nnorth,42\nsouth,17\n").expect("write");
    project.cfg.sandbox.data_dir = Some(PathBuf::from("data"));

    let agent = ScriptedAgent::new();
    let result = project.run(&agent, &ScriptedSandbox::new());

    assert_eq!(result.completed, 1);
    let summaries = agent.data_summaries();
    assert!(!summaries.is_empty());
    for summary in &summaries {
        assert!(summary.contains("/data/sales.csv"), "{summary}");
        assert!(summary.contains("2 column(s): region, sales"), "{summary}");
        assert!(summary.contains("north,42"), "{summary}");
    }
}

#[test]
fn running_node_left_by_a_crash_is_restarted() {
    let project = Project::new(&plan(vec![atomic("x")]));
    project
        .store()
        .save_status("plan", "x", NodeStatus::Running, None)
        .expect("save");

    let agent = ScriptedAgent::new();
    let result = project.run(&agent, &ScriptedSandbox::new());
    assert_eq!(result.completed, 1);
    assert_eq!(project.started(), vec!["x"]);
}

#[test]
fn plan_deadline_cancels_in_flight_sandbox_and_skips_the_rest() {
    let project = Project::new(&plan(vec![atomic("slow"), atomic("after").depends_on(&["slow"])]));
    let agent = ScriptedAgent::new().for_node("slow", code_node("sleep 30"));
    let request = RunRequest {
        plan_id: "plan".to_string(),
        ..RunRequest::default()
    };
    let cancel = CancelToken::with_deadline(std::time::Instant::now() + std::time::Duration::from_secs(1));
    let started = std::time::Instant::now();
    let result = run_plan_with(project.root(), &project.cfg, &request, &agent, &sh(), cancel)
        .expect("run");

    assert!(started.elapsed() < std::time::Duration::from_secs(8));
    assert!(result.cancelled);
    assert_eq!(exit_codes::for_run(&result), exit_codes::CANCELLED);
    let slow = project.record("slow");
    assert_eq!(slow.status, NodeStatus::Failed);
    assert_eq!(slow.error_message.as_deref(), Some("cancelled"));
    let after = project.record("after");
    assert_eq!(after.status, NodeStatus::Skipped);
    assert_eq!(after.error_message.as_deref(), Some("plan cancelled"));
}

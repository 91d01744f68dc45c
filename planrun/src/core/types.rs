//! Shared types for execution records and run-level results.
//!
//! Records are immutable once persisted; a re-run replaces the whole record.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::NodeStatus;

/// Classification outcome for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// The node's work is done by running generated code.
    CodeRequired,
    /// The node can be answered directly in text.
    TextOnly,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::CodeRequired => "code_required",
            TaskType::TextOnly => "text_only",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one node execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    /// Terminal status this record was produced for.
    pub status: NodeStatus,
    pub task_type: Option<TaskType>,
    pub code: Option<String>,
    pub code_description: Option<String>,
    pub code_output: Option<String>,
    pub code_error: Option<String>,
    #[serde(default)]
    pub total_attempts: u32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub has_visualization: bool,
    pub visualization_purpose: Option<String>,
    pub visualization_analysis: Option<String>,
    pub text_response: Option<String>,
    pub gathered_info: Option<String>,
    #[serde(default)]
    pub info_gathering_rounds: u32,
    /// Output files relative to the plan output directory, in discovery order.
    #[serde(default)]
    pub generated_files: Vec<String>,
    /// Dependencies or children that had not completed when this node ran.
    #[serde(default)]
    pub unmet_dependencies: Vec<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl NodeExecutionRecord {
    /// Empty record for `status`; callers fill in the fields they own.
    pub fn new(status: NodeStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            status,
            task_type: None,
            code: None,
            code_description: None,
            code_output: None,
            code_error: None,
            total_attempts: 0,
            timed_out: false,
            has_visualization: false,
            visualization_purpose: None,
            visualization_analysis: None,
            text_response: None,
            gathered_info: None,
            info_gathering_rounds: 0,
            generated_files: Vec::new(),
            unmet_dependencies: Vec::new(),
            error_message: None,
            started_at,
            completed_at: started_at,
        }
    }

    /// Record for a node that was never executed.
    pub fn skipped(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut record = Self::new(NodeStatus::Skipped, at);
        record.error_message = Some(reason.into());
        record
    }
}

/// Node counts by terminal outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Nodes not in a terminal state (only non-zero for an interrupted run).
    pub pending: usize,
}

impl RunStats {
    pub fn from_statuses<I: IntoIterator<Item = NodeStatus>>(statuses: I) -> Self {
        let mut stats = RunStats::default();
        for status in statuses {
            stats.total += 1;
            match status {
                NodeStatus::Completed => stats.completed += 1,
                NodeStatus::Failed => stats.failed += 1,
                NodeStatus::Skipped => stats.skipped += 1,
                NodeStatus::Pending | NodeStatus::Running => stats.pending += 1,
            }
        }
        stats
    }
}

/// Run-level read model assembled from node state after a run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanExecutionResult {
    pub plan_id: String,
    pub title: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub records: BTreeMap<String, NodeExecutionRecord>,
    pub generated_files: Vec<String>,
    pub report_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PlanExecutionResult {
    /// Every node completed and the run was not cancelled.
    pub fn success(&self) -> bool {
        self.completed == self.total && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_serializes_snake_case() {
        let json = serde_json::to_string(&TaskType::CodeRequired).expect("serialize");
        assert_eq!(json, "\"code_required\"");
        let parsed: TaskType = serde_json::from_str("\"text_only\"").expect("parse");
        assert_eq!(parsed, TaskType::TextOnly);
    }

    #[test]
    fn stats_count_every_status() {
        let stats = RunStats::from_statuses([
            NodeStatus::Completed,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Pending,
        ]);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn skipped_record_keeps_reason() {
        let record = NodeExecutionRecord::skipped("missing dependency 'x'", Utc::now());
        assert_eq!(record.status, NodeStatus::Skipped);
        assert_eq!(
            record.error_message.as_deref(),
            Some("missing dependency 'x'")
        );
        assert_eq!(record.started_at, record.completed_at);
    }

    fn result(completed: usize, failed: usize, skipped: usize, cancelled: bool) -> PlanExecutionResult {
        let now = Utc::now();
        PlanExecutionResult {
            plan_id: "plan".to_string(),
            title: "Plan".to_string(),
            total: completed + failed + skipped,
            completed,
            failed,
            skipped,
            cancelled,
            records: BTreeMap::new(),
            generated_files: Vec::new(),
            report_path: None,
            started_at: now,
            completed_at: now,
        }
    }

    #[test]
    fn success_needs_every_node_completed() {
        assert!(result(3, 0, 0, false).success());
        assert!(!result(2, 1, 0, false).success());
        // A node skipped for a dependency cycle leaves the plan incomplete.
        assert!(!result(2, 0, 1, false).success());
        assert!(!result(3, 0, 0, true).success());
    }
}

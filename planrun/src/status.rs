//! Read model for `planrun status`.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::{RunStats, TaskType};
use crate::io::store::PlanStore;
use crate::plan::{NodeKind, NodeStatus};

/// One node's line in the status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub title: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub generated_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStatus {
    pub plan_id: String,
    pub title: String,
    pub stats: RunStats,
    pub nodes: Vec<NodeSummary>,
}

pub fn plan_status(store: &dyn PlanStore, plan_id: &str) -> Result<PlanStatus> {
    let plan = store
        .load_plan(plan_id)
        .with_context(|| format!("load plan '{plan_id}'"))?;
    let stats = RunStats::from_statuses(plan.nodes.iter().map(|node| node.status));
    let nodes = plan
        .nodes
        .into_iter()
        .map(|node| {
            let record = node.execution_result.as_ref();
            NodeSummary {
                task_type: record.and_then(|r| r.task_type).or(node.task_type),
                attempts: record.map_or(0, |r| r.total_attempts),
                error: record.and_then(|r| r.error_message.clone()),
                generated_files: record.map(|r| r.generated_files.clone()).unwrap_or_default(),
                id: node.id,
                title: node.title,
                kind: node.kind,
                status: node.status,
            }
        })
        .collect();
    Ok(PlanStatus {
        plan_id: plan.id,
        title: plan.title,
        stats,
        nodes,
    })
}

impl PlanStatus {
    /// Plain-text table, one node per line; errors show their first line only.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} ({}): {}/{} completed, {} failed, {} skipped, {} pending\n",
            self.title,
            self.plan_id,
            self.stats.completed,
            self.stats.total,
            self.stats.failed,
            self.stats.skipped,
            self.stats.pending
        );
        let width = self.nodes.iter().map(|n| n.id.len()).max().unwrap_or(0);
        for node in &self.nodes {
            let _ = write!(
                out,
                "  {:<9} {:<width$}  {}",
                node.status.as_str(),
                node.id,
                node.title
            );
            if node.attempts > 0 {
                let _ = write!(out, " [{} attempt(s)]", node.attempts);
            }
            if let Some(line) = node.error.as_deref().and_then(|e| e.lines().next()) {
                let _ = write!(out, " - {line}");
            }
            out.push('\n');
        }
        out
    }
}

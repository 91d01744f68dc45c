//! Plan graph data model: nodes, kinds, and lifecycle status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{NodeExecutionRecord, TaskType};

/// Structural role of a node in the plan hierarchy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Composite,
    Atomic,
}

impl NodeKind {
    /// Root and composite nodes aggregate the results of their children.
    pub fn aggregates(self) -> bool {
        matches!(self, NodeKind::Root | NodeKind::Composite)
    }
}

/// Execution status of a node. `Completed`, `Failed`, and `Skipped` are terminal.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the plan graph.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub instruction: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Forced task type; skips classification when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    /// Request the visualization-aware generation path.
    #[serde(default)]
    pub visualization: bool,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<NodeExecutionRecord>,
}

impl PlanNode {
    /// Text describing the work, falling back to the title for terse nodes.
    pub fn task_description(&self) -> &str {
        if self.instruction.trim().is_empty() {
            &self.title
        } else {
            &self.instruction
        }
    }
}

/// A plan: its identity plus every node in definition order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub nodes: Vec<PlanNode>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut PlanNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    /// Ids of the direct children of `id`, in definition order.
    pub fn children_ids(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.parent_id.as_deref() == Some(id))
            .map(|node| node.id.as_str())
            .collect()
    }
}

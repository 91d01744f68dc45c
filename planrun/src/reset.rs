//! `planrun reset`: the only way back out of a terminal status.

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::store::PlanStore;
use crate::plan::NodeStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetScope {
    All,
    /// Failed and skipped nodes.
    Failed,
    Node(String),
}

/// Return the nodes in `scope` to `pending` and drop their records.
///
/// Returns the ids that were reset, in plan order.
pub fn reset_plan(store: &dyn PlanStore, plan_id: &str, scope: &ResetScope) -> Result<Vec<String>> {
    let plan = store
        .load_plan(plan_id)
        .with_context(|| format!("load plan '{plan_id}'"))?;
    if let ResetScope::Node(id) = scope {
        if plan.node(id).is_none() {
            return Err(anyhow!("plan '{plan_id}' has no node '{id}'"));
        }
    }

    let mut reset = Vec::new();
    for node in &plan.nodes {
        let selected = match scope {
            ResetScope::All => {
                node.status != NodeStatus::Pending || node.execution_result.is_some()
            }
            ResetScope::Failed => {
                matches!(node.status, NodeStatus::Failed | NodeStatus::Skipped)
            }
            ResetScope::Node(id) => &node.id == id,
        };
        if selected {
            store.save_status(plan_id, &node.id, NodeStatus::Pending, None)?;
            reset.push(node.id.clone());
        }
    }
    info!(plan_id, reset = reset.len(), "nodes reset");
    Ok(reset)
}

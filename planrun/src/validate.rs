//! `planrun validate`: schema, invariants, and run-time skip warnings.

use std::path::Path;

use anyhow::Result;

use crate::core::graph::PlanGraph;
use crate::io::plan_file::load_plan_file;
use crate::io::store::{FilePlanStore, PlanStore};
use crate::plan::Plan;

/// Result of validating a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateOutcome {
    pub plan_id: String,
    pub nodes: usize,
    /// Nodes that will be skipped when the plan runs, with the reason.
    pub warnings: Vec<String>,
}

/// Validate `target`, either a plan file path or the id of an imported plan.
pub fn validate_plan(root: &Path, target: &str) -> Result<ValidateOutcome> {
    let path = Path::new(target);
    let plan = if path.is_file() {
        load_plan_file(path)?
    } else {
        FilePlanStore::new(root).load_plan(target)?
    };
    Ok(outcome(&plan))
}

fn outcome(plan: &Plan) -> ValidateOutcome {
    let graph = PlanGraph::new(plan);
    let warnings = (0..graph.len())
        .filter_map(|i| {
            graph
                .blocker(i)
                .map(|blocker| format!("node '{}' will be skipped: {}", graph.id(i), blocker.reason()))
        })
        .collect();
    ValidateOutcome {
        plan_id: plan.id.clone(),
        nodes: plan.nodes.len(),
        warnings,
    }
}

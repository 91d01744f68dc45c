//! Persistence of plan definitions and per-node execution state.
//!
//! Each node's `{status, execution_result}` lives in its own file and is replaced
//! atomically, so a crash never leaves a half-written record behind.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::NodeExecutionRecord;
use crate::io::fsutil::{read_json, write_json_atomic};
use crate::io::init::PlanrunPaths;
use crate::io::plan_file::{load_plan_file, write_plan_file};
use crate::plan::{NodeStatus, Plan, PlanNode};

/// Persisted state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub execution_result: Option<NodeExecutionRecord>,
}

pub trait PlanStore: Send + Sync {
    /// Plan definitions merged with the latest persisted node state.
    fn load_plan(&self, plan_id: &str) -> Result<Plan>;

    fn load_nodes(&self, plan_id: &str) -> Result<Vec<PlanNode>> {
        Ok(self.load_plan(plan_id)?.nodes)
    }

    /// Persist one node's status and record in a single write.
    fn save_status(
        &self,
        plan_id: &str,
        node_id: &str,
        status: NodeStatus,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<()>;
}

/// Store rooted at a project's `.planrun/` directory.
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    paths: PlanrunPaths,
}

impl FilePlanStore {
    pub fn new(root: &Path) -> Self {
        Self {
            paths: PlanrunPaths::new(root),
        }
    }

    pub fn paths(&self) -> &PlanrunPaths {
        &self.paths
    }

    /// Validate `plan` and store its definitions. Existing node state is discarded
    /// unless `keep_state` is set.
    #[instrument(skip_all, fields(plan_id = %plan.id))]
    pub fn import_plan(&self, plan: &Plan, keep_state: bool) -> Result<()> {
        let plan_paths = self.paths.plan(&plan.id);
        if !keep_state && plan_paths.nodes_dir.exists() {
            fs::remove_dir_all(&plan_paths.nodes_dir).with_context(|| {
                format!("remove node state {}", plan_paths.nodes_dir.display())
            })?;
        }
        fs::create_dir_all(&plan_paths.nodes_dir)
            .with_context(|| format!("create {}", plan_paths.nodes_dir.display()))?;
        write_plan_file(&plan_paths.plan_path, plan)?;
        debug!(nodes = plan.nodes.len(), "plan imported");
        Ok(())
    }

    /// Ids of every stored plan, sorted.
    pub fn list_plans(&self) -> Result<Vec<String>> {
        if !self.paths.plans_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.paths.plans_dir)
            .with_context(|| format!("read {}", self.paths.plans_dir.display()))?
        {
            let entry = entry?;
            if entry.path().join("plan.json").is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl PlanStore for FilePlanStore {
    fn load_plan(&self, plan_id: &str) -> Result<Plan> {
        let plan_paths = self.paths.plan(plan_id);
        if !plan_paths.plan_path.exists() {
            return Err(anyhow!(
                "unknown plan '{plan_id}' (import it with `planrun import`)"
            ));
        }
        let mut plan = load_plan_file(&plan_paths.plan_path)?;
        if plan.id != plan_id {
            return Err(anyhow!(
                "plan file {} declares id '{}'",
                plan_paths.plan_path.display(),
                plan.id
            ));
        }
        for node in &mut plan.nodes {
            let state_path = plan_paths.node_state_path(&node.id);
            if state_path.exists() {
                let state: NodeState = read_json(&state_path)?;
                node.status = state.status;
                node.execution_result = state.execution_result;
            }
        }
        Ok(plan)
    }

    fn save_status(
        &self,
        plan_id: &str,
        node_id: &str,
        status: NodeStatus,
        record: Option<&NodeExecutionRecord>,
    ) -> Result<()> {
        let path = self.paths.plan(plan_id).node_state_path(node_id);
        let state = NodeState {
            status,
            execution_result: record.cloned(),
        };
        write_json_atomic(&path, &state)
            .with_context(|| format!("save state of node '{node_id}'"))
    }
}

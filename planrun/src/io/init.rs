//! Canonical `.planrun/` layout and project initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::config::{EngineConfig, write_config};

const PLANRUN_GITIGNORE: &str = "output/\n";

/// All canonical paths within `.planrun/` for a project root.
#[derive(Debug, Clone)]
pub struct PlanrunPaths {
    pub root: PathBuf,
    pub planrun_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub plans_dir: PathBuf,
    pub output_root: PathBuf,
}

impl PlanrunPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let planrun_dir = root.join(".planrun");
        Self {
            root: root.clone(),
            config_path: planrun_dir.join("config.toml"),
            gitignore_path: planrun_dir.join(".gitignore"),
            plans_dir: planrun_dir.join("plans"),
            output_root: planrun_dir.join("output"),
            planrun_dir,
        }
    }

    pub fn plan(&self, plan_id: &str) -> PlanPaths {
        let dir = self.plans_dir.join(plan_id);
        PlanPaths {
            plan_path: dir.join("plan.json"),
            nodes_dir: dir.join("nodes"),
            events_path: dir.join("events.jsonl"),
            output_dir: self.output_root.join(plan_id),
            dir,
        }
    }
}

/// Paths owned by a single plan.
#[derive(Debug, Clone)]
pub struct PlanPaths {
    pub dir: PathBuf,
    pub plan_path: PathBuf,
    pub nodes_dir: PathBuf,
    pub events_path: PathBuf,
    /// Root of node scratch mounts and reports.
    pub output_dir: PathBuf,
}

impl PlanPaths {
    pub fn node_state_path(&self, node_id: &str) -> PathBuf {
        self.nodes_dir.join(format!("{node_id}.json"))
    }

    /// Scratch mount for one node, relative to which generated files are reported.
    pub fn node_workspace(&self, node_id: &str) -> PathBuf {
        self.output_dir.join("nodes").join(node_id)
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Create `.planrun/` scaffolding in `root`.
///
/// Fails if `.planrun/` already exists unless `options.force` is set. Plans and
/// node state are never touched by a forced init.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<PlanrunPaths> {
    let paths = PlanrunPaths::new(root);
    if paths.planrun_dir.exists() && !paths.planrun_dir.is_dir() {
        return Err(anyhow!("planrun init: .planrun exists but is not a directory"));
    }
    if paths.planrun_dir.exists() && !options.force {
        return Err(anyhow!(
            "planrun init: .planrun already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.planrun_dir)?;
    create_dir(&paths.plans_dir)?;
    create_dir(&paths.output_root)?;
    fs::write(&paths.gitignore_path, PLANRUN_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;

    info!(root = %root.display(), "initialized .planrun");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

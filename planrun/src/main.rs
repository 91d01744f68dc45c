//! Plan execution engine CLI.
//!
//! Imports plan graphs into `.planrun/plans/`, runs them node by node through
//! an agent command and a code sandbox, and reports per-node status.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use planrun::core::types::TaskType;
use planrun::exit_codes;
use planrun::io::init::{InitOptions, init_project};
use planrun::io::plan_file::load_plan_file;
use planrun::io::store::FilePlanStore;
use planrun::logging;
use planrun::reset::{ResetScope, reset_plan};
use planrun::run::{RunRequest, run_plan};
use planrun::status::plan_status;
use planrun::validate::validate_plan;

#[derive(Parser)]
#[command(name = "planrun", version, about = "Run plan graphs through an agent and a code sandbox")]
struct Cli {
    /// Project root containing `.planrun/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.planrun/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate a plan file and store it under `.planrun/plans/<id>/`.
    Import {
        file: PathBuf,
        /// Keep node state from an earlier import of the same plan.
        #[arg(long)]
        keep_state: bool,
    },
    /// Check a plan file (or imported plan id) against the schema and invariants.
    Validate { plan: String },
    /// Execute every runnable node of an imported plan.
    #[command(group(ArgGroup::new("force").args(["force_code", "force_text"])))]
    Run {
        plan: String,
        /// Nodes executed concurrently (overrides config).
        #[arg(long)]
        workers: Option<usize>,
        /// Treat every node as code_required.
        #[arg(long)]
        force_code: bool,
        /// Treat every node as text_only.
        #[arg(long)]
        force_text: bool,
        /// Print the run result as JSON instead of a summary.
        #[arg(long)]
        json: bool,
        /// Suppress per-node progress lines.
        #[arg(short, long)]
        quiet: bool,
    },
    /// Show per-node status of an imported plan.
    Status {
        plan: String,
        #[arg(long)]
        json: bool,
    },
    /// Return nodes to pending so the next run executes them again.
    #[command(group(ArgGroup::new("scope").args(["failed", "node"])))]
    Reset {
        plan: String,
        /// Only failed and skipped nodes.
        #[arg(long)]
        failed: bool,
        /// Only this node.
        #[arg(long)]
        node: Option<String>,
    },
    /// List imported plans.
    List,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Import { file, keep_state } => cmd_import(root, &file, keep_state),
        Command::Validate { plan } => cmd_validate(root, &plan),
        Command::Run {
            plan,
            workers,
            force_code,
            force_text,
            json,
            quiet,
        } => {
            let force_task_type = if force_code {
                Some(TaskType::CodeRequired)
            } else if force_text {
                Some(TaskType::TextOnly)
            } else {
                None
            };
            let request = RunRequest {
                plan_id: plan,
                workers,
                force_task_type,
                progress: !quiet,
            };
            cmd_run(root, &request, json)
        }
        Command::Status { plan, json } => cmd_status(root, &plan, json),
        Command::Reset { plan, failed, node } => {
            let scope = match (failed, node) {
                (_, Some(id)) => ResetScope::Node(id),
                (true, None) => ResetScope::Failed,
                (false, None) => ResetScope::All,
            };
            cmd_reset(root, &plan, &scope)
        }
        Command::List => cmd_list(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_project(root, &InitOptions { force })?;
    println!("initialized {}", paths.planrun_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_import(root: &Path, file: &Path, keep_state: bool) -> Result<i32> {
    let plan = load_plan_file(file)?;
    FilePlanStore::new(root)
        .import_plan(&plan, keep_state)
        .with_context(|| format!("import plan '{}'", plan.id))?;
    println!("imported plan '{}' ({} nodes)", plan.id, plan.nodes.len());
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path, target: &str) -> Result<i32> {
    let outcome = validate_plan(root, target)?;
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("plan '{}' is valid ({} nodes)", outcome.plan_id, outcome.nodes);
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, request: &RunRequest, json: bool) -> Result<i32> {
    let result = run_plan(root, request)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serialize run result")?
        );
    } else {
        println!(
            "{}: {} completed, {} failed, {} skipped of {}{}",
            result.plan_id,
            result.completed,
            result.failed,
            result.skipped,
            result.total,
            if result.cancelled { " (cancelled)" } else { "" }
        );
        if let Some(report) = &result.report_path {
            println!("report: {}", report.display());
        }
    }
    Ok(exit_codes::for_run(&result))
}

fn cmd_status(root: &Path, plan_id: &str, json: bool) -> Result<i32> {
    let status = plan_status(&FilePlanStore::new(root), plan_id)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serialize status")?
        );
    } else {
        print!("{}", status.render());
    }
    Ok(exit_codes::OK)
}

fn cmd_reset(root: &Path, plan_id: &str, scope: &ResetScope) -> Result<i32> {
    let reset = reset_plan(&FilePlanStore::new(root), plan_id, scope)?;
    println!("reset {} node(s)", reset.len());
    Ok(exit_codes::OK)
}

fn cmd_list(root: &Path) -> Result<i32> {
    for id in FilePlanStore::new(root).list_plans()? {
        println!("{id}");
    }
    Ok(exit_codes::OK)
}

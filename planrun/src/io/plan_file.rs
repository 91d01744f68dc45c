//! Plan file load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::warn;

use crate::core::invariants::{missing_dependencies, validate_invariants};
use crate::io::fsutil::write_json_atomic;
use crate::plan::Plan;

pub const PLAN_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/plan/v1.schema.json"
));

/// Parse and validate a plan: schema conformance + semantic invariants.
///
/// Dependencies on unknown ids are allowed (those nodes are skipped at run time)
/// but logged.
pub fn parse_plan(raw: &str) -> Result<Plan> {
    let value: Value = serde_json::from_str(raw).context("parse plan json")?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value).context("deserialize plan")?;
    let errors = validate_invariants(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
    }
    for (node, missing) in missing_dependencies(&plan) {
        warn!(node = %node, missing = %missing, "dependency names an unknown node");
    }
    Ok(plan)
}

pub fn load_plan_file(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&raw).with_context(|| format!("invalid plan {}", path.display()))
}

/// Write plan definitions atomically.
pub fn write_plan_file(path: &Path, plan: &Plan) -> Result<()> {
    write_json_atomic(path, plan)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse bundled plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NodeKind, NodeStatus};

    const VALID: &str = r#"{
        "id": "sales",
        "title": "Sales analysis",
        "nodes": [
            {"id": "root", "title": "Analyse", "kind": "root"},
            {"id": "load", "title": "Load data", "kind": "atomic", "parent_id": "root"},
            {"id": "plot", "title": "Plot", "kind": "atomic", "parent_id": "root",
             "dependencies": ["load"], "visualization": true, "task_type": "code_required"}
        ]
    }"#;

    #[test]
    fn parses_valid_plan() {
        let plan = parse_plan(VALID).expect("parse");
        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(plan.nodes[0].kind, NodeKind::Root);
        assert!(plan.nodes[2].visualization);
        assert_eq!(plan.nodes[2].status, NodeStatus::Pending);
    }

    #[test]
    fn rejects_schema_violations() {
        let err = parse_plan(r#"{"id":"p","title":"P","nodes":[{"id":"a","title":"A","kind":"leaf"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));

        let err = parse_plan(r#"{"id":"p","title":"P","nodes":[{"id":"a/b","title":"A","kind":"atomic"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn rejects_invariant_violations() {
        let err = parse_plan(
            r#"{"id":"p","title":"P","nodes":[
                {"id":"a","title":"A","kind":"atomic"},
                {"id":"a","title":"A again","kind":"atomic"}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate id 'a'"));
    }

    #[test]
    fn unknown_dependency_is_accepted() {
        let plan = parse_plan(
            r#"{"id":"p","title":"P","nodes":[
                {"id":"a","title":"A","kind":"atomic","dependencies":["ghost"]}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(plan.nodes[0].dependencies, vec!["ghost".to_string()]);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let plan = parse_plan(VALID).expect("parse");
        write_plan_file(&path, &plan).expect("write");
        assert_eq!(load_plan_file(&path).expect("load"), plan);
    }
}

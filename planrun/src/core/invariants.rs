//! Semantic plan invariants not expressible via JSON Schema.

use std::collections::{HashMap, HashSet};

use crate::plan::{NodeKind, Plan};

/// Check structural invariants of a plan:
/// - Plan and node ids usable as file names
/// - Unique node ids
/// - `parent_id` names an existing root/composite node other than itself
/// - Root nodes have no parent
///
/// Missing dependency ids and cycles are not reported here; the scheduler skips
/// those nodes instead of rejecting the plan (see [`crate::core::graph`]).
pub fn validate_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if !is_safe_id(&plan.id) {
        errors.push(format!("invalid plan id '{}'", plan.id));
    }
    let mut seen = HashSet::new();
    let kinds: HashMap<&str, NodeKind> = plan
        .nodes
        .iter()
        .map(|node| (node.id.as_str(), node.kind))
        .collect();

    for node in &plan.nodes {
        if node.id.trim().is_empty() {
            errors.push("node with empty id".to_string());
            continue;
        }
        if !is_safe_id(&node.id) {
            errors.push(format!(
                "{}: id must start with a letter or digit and use only [A-Za-z0-9._-]",
                node.id
            ));
        }
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate id '{}'", node.id));
        }

        match node.parent_id.as_deref() {
            Some(parent) if parent == node.id => {
                errors.push(format!("{}: node is its own parent", node.id));
            }
            Some(parent) => match kinds.get(parent) {
                None => errors.push(format!("{}: unknown parent '{}'", node.id, parent)),
                Some(kind) if !kind.aggregates() => errors.push(format!(
                    "{}: parent '{}' is atomic and cannot own children",
                    node.id, parent
                )),
                Some(_) => {}
            },
            None => {}
        }

        if node.kind == NodeKind::Root && node.parent_id.is_some() {
            errors.push(format!("{}: root node must not have a parent", node.id));
        }
    }

    errors
}

/// Ids become file and directory names under `.planrun/`.
pub fn is_safe_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Dependency ids that do not name any node in the plan, as `(node, missing)` pairs.
pub fn missing_dependencies(plan: &Plan) -> Vec<(String, String)> {
    let ids: HashSet<&str> = plan.nodes.iter().map(|node| node.id.as_str()).collect();
    let mut missing = Vec::new();
    for node in &plan.nodes {
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                missing.push((node.id.clone(), dep.clone()));
            }
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{atomic, composite, plan, root};

    #[test]
    fn valid_plan_has_no_errors() {
        let plan = plan(vec![
            root("r"),
            atomic("a").with_parent("r"),
            composite("c").with_parent("r"),
            atomic("c1").with_parent("c").depends_on(&["a"]),
        ]);
        assert!(validate_invariants(&plan).is_empty());
    }

    #[test]
    fn reports_duplicates_and_bad_parents() {
        let plan = plan(vec![
            root("r"),
            atomic("a").with_parent("r"),
            atomic("a"),
            atomic("b").with_parent("a"),
            atomic("c").with_parent("ghost"),
            root("r2").with_parent("r"),
        ]);
        let errors = validate_invariants(&plan);
        assert!(errors.iter().any(|err| err.contains("duplicate id 'a'")));
        assert!(errors.iter().any(|err| err.contains("is atomic")));
        assert!(errors.iter().any(|err| err.contains("unknown parent 'ghost'")));
        assert!(errors.iter().any(|err| err.contains("root node must not have a parent")));
    }

    #[test]
    fn rejects_ids_unusable_as_file_names() {
        assert!(is_safe_id("step-1.a_b"));
        assert!(!is_safe_id("../etc"));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id(".hidden"));
        let plan = plan(vec![atomic("ok"), atomic("a b")]);
        let errors = validate_invariants(&plan);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("a b:"));
    }

    #[test]
    fn lists_missing_dependencies() {
        let plan = plan(vec![atomic("a").depends_on(&["nope"]), atomic("b")]);
        assert_eq!(
            missing_dependencies(&plan),
            vec![("a".to_string(), "nope".to_string())]
        );
    }
}

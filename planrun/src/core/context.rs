//! Context handed to a node from the outputs of the nodes it waited on.
//!
//! Dependencies come first, then children, each listed once. Inputs that did not
//! complete are still included, tagged with [`UNMET_MARKER`].

use crate::core::graph::PlanGraph;
use crate::plan::{NodeStatus, Plan, PlanNode};

pub const UNMET_MARKER: &str = "UNMET DEPENDENCY";

/// Context assembled for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeContext {
    /// Rendered text passed to collaborators.
    pub text: String,
    /// Ids of inputs that were failed or skipped.
    pub unmet: Vec<String>,
}

impl NodeContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Build the context for the node at `index` from current plan state.
pub fn build_node_context(
    plan: &Plan,
    graph: &PlanGraph,
    index: usize,
    limit_chars: usize,
) -> NodeContext {
    let mut context = NodeContext::default();
    let dependencies = graph.dependencies(index);
    let mut sections = Vec::new();

    for input in graph.waits(index) {
        let node = &plan.nodes[input];
        let relation = if dependencies.contains(&input) {
            "Dependency"
        } else {
            "Subtask"
        };
        if matches!(node.status, NodeStatus::Failed | NodeStatus::Skipped) {
            context.unmet.push(node.id.clone());
        }
        sections.push(render_input(relation, node, limit_chars));
    }

    context.text = sections.join("\n\n");
    context
}

/// Warning line recorded when a node ran with unmet inputs.
pub fn unmet_warning(unmet: &[String]) -> Option<String> {
    if unmet.is_empty() {
        return None;
    }
    Some(format!(
        "WARNING: {UNMET_MARKER}: {} did not complete; their output is partial or missing.",
        unmet.join(", ")
    ))
}

fn render_input(relation: &str, node: &PlanNode, limit_chars: usize) -> String {
    let mut header = format!("### {relation}: {} ({}) [{}]", node.title, node.id, node.status);
    if matches!(node.status, NodeStatus::Failed | NodeStatus::Skipped) {
        header.push_str(&format!(" {UNMET_MARKER}"));
    }
    let body = node_output(node).unwrap_or("(no output)");
    format!("{header}\n{}", truncate_chars(body.trim(), limit_chars))
}

fn node_output(node: &PlanNode) -> Option<&str> {
    let record = node.execution_result.as_ref()?;
    let output = match node.status {
        NodeStatus::Completed => record
            .text_response
            .as_deref()
            .or(record.code_output.as_deref()),
        _ => record
            .code_output
            .as_deref()
            .filter(|out| !out.trim().is_empty())
            .or(record.error_message.as_deref()),
    };
    output.filter(|text| !text.trim().is_empty())
}

/// Keep at most `limit` characters, noting how many were dropped.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{kept}\n[truncated {} chars]", total - limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeExecutionRecord;
    use crate::test_support::{atomic, plan, root};
    use chrono::Utc;

    fn finish(node: &mut PlanNode, status: NodeStatus, output: &str) {
        let mut record = NodeExecutionRecord::new(status, Utc::now());
        if status == NodeStatus::Completed {
            record.code_output = Some(output.to_string());
        } else {
            record.error_message = Some(output.to_string());
        }
        node.status = status;
        node.execution_result = Some(record);
    }

    #[test]
    fn dependencies_precede_children_and_are_listed_once() {
        let mut plan = plan(vec![
            root("r").depends_on(&["d"]),
            atomic("c").with_parent("r"),
            atomic("d"),
        ]);
        // `d` is both a dependency and not a child; `c` is the only child.
        finish(&mut plan.nodes[1], NodeStatus::Completed, "child out");
        finish(&mut plan.nodes[2], NodeStatus::Completed, "dep out");
        let graph = PlanGraph::new(&plan);

        let context = build_node_context(&plan, &graph, 0, 2000);
        let dep_at = context.text.find("Dependency: d title (d)").expect("dep");
        let child_at = context.text.find("Subtask: c title (c)").expect("child");
        assert!(dep_at < child_at);
        assert!(context.unmet.is_empty());
        assert_eq!(context.text.matches("dep out").count(), 1);
    }

    #[test]
    fn failed_inputs_are_marked_unmet() {
        let mut plan = plan(vec![atomic("e"), atomic("d").depends_on(&["e"])]);
        finish(&mut plan.nodes[0], NodeStatus::Failed, "Traceback: boom");
        let graph = PlanGraph::new(&plan);

        let context = build_node_context(&plan, &graph, 1, 2000);
        assert_eq!(context.unmet, vec!["e".to_string()]);
        assert!(context.text.contains(UNMET_MARKER));
        assert!(context.text.contains("Traceback: boom"));
        let warning = unmet_warning(&context.unmet).expect("warning");
        assert!(warning.contains("e did not complete"));
    }

    #[test]
    fn long_outputs_are_truncated() {
        let mut plan = plan(vec![atomic("a"), atomic("b").depends_on(&["a"])]);
        finish(&mut plan.nodes[0], NodeStatus::Completed, &"x".repeat(50));
        let graph = PlanGraph::new(&plan);

        let context = build_node_context(&plan, &graph, 1, 10);
        assert!(context.text.contains(&"x".repeat(10)));
        assert!(!context.text.contains(&"x".repeat(11)));
        assert!(context.text.contains("[truncated 40 chars]"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("héllo", 5), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé\n[truncated 3 chars]");
    }

    #[test]
    fn no_inputs_yields_empty_context() {
        let plan = plan(vec![atomic("solo")]);
        let graph = PlanGraph::new(&plan);
        assert!(build_node_context(&plan, &graph, 0, 2000).is_empty());
        assert_eq!(unmet_warning(&[]), None);
    }
}

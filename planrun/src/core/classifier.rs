//! Deterministic classification of task types and generated files.

use std::path::Path;

use crate::core::types::TaskType;

/// File extensions treated as chart output for the report.
pub const CHART_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg", "pdf", "gif"];

/// Map a classifier's `task_type` string to a [`TaskType`].
///
/// Only `code_required` and `text_only` are accepted (any case, surrounding
/// whitespace ignored). Anything else, including an empty string, is `None`.
pub fn parse_task_type(raw: &str) -> Option<TaskType> {
    let raw = raw.trim();
    [TaskType::CodeRequired, TaskType::TextOnly]
        .into_iter()
        .find(|task_type| raw.eq_ignore_ascii_case(task_type.as_str()))
}

/// Resolve the task type for a node: a per-run force wins over the node's own override.
pub fn forced_task_type(run_force: Option<TaskType>, node_override: Option<TaskType>) -> Option<TaskType> {
    run_force.or(node_override)
}

pub fn is_chart_file<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            CHART_EXTENSIONS
                .iter()
                .any(|chart| ext.eq_ignore_ascii_case(chart))
        })
}

/// Chart-like files among `files`, in their original order.
pub fn chart_files(files: &[String]) -> Vec<&str> {
    files
        .iter()
        .filter(|file| is_chart_file(file.as_str()))
        .map(String::as_str)
        .collect()
}

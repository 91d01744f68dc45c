//! Collaborator seams for classification, generation, and information probes.
//!
//! The task executor owns every retry decision; collaborators make exactly one
//! attempt per call and report failure through `Result`.

use std::fmt;

use anyhow::Result;
use serde::Deserialize;

use crate::core::types::TaskType;
use crate::plan::PlanNode;

/// Everything a collaborator may see about the node being executed.
#[derive(Debug, Clone, Copy)]
pub struct TaskBrief<'a> {
    pub node_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    /// Outputs of dependencies and children.
    pub context: &'a str,
    /// Probe output accumulated so far.
    pub gathered_info: &'a str,
    /// Summary of the files under the data mount.
    pub data_summary: &'a str,
    pub visualization: bool,
}

impl<'a> TaskBrief<'a> {
    pub fn new(node: &'a PlanNode, context: &'a str, gathered_info: &'a str) -> Self {
        Self {
            node_id: &node.id,
            title: &node.title,
            description: node.task_description(),
            context,
            gathered_info,
            data_summary: "",
            visualization: node.visualization,
        }
    }

    pub fn with_data(mut self, data_summary: &'a str) -> Self {
        self.data_summary = data_summary;
        self
    }
}

/// Code proposed by a generator, with optional chart narrative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GeneratedCode {
    pub code: String,
    pub description: String,
    pub has_visualization: bool,
    pub visualization_purpose: Option<String>,
    pub visualization_analysis: Option<String>,
}

impl GeneratedCode {
    pub fn is_empty(&self) -> bool {
        self.code.trim().is_empty()
    }

    /// Fill description and chart fields a repair left blank from the code it replaces.
    pub fn inherit_narrative(mut self, previous: &GeneratedCode) -> Self {
        self.has_visualization |= previous.has_visualization;
        if self.description.trim().is_empty() {
            self.description.clone_from(&previous.description);
        }
        if blank(self.visualization_purpose.as_deref()) {
            self.visualization_purpose.clone_from(&previous.visualization_purpose);
        }
        if blank(self.visualization_analysis.as_deref()) {
            self.visualization_analysis.clone_from(&previous.visualization_analysis);
        }
        self
    }
}

fn blank(text: Option<&str>) -> bool {
    text.is_none_or(|text| text.trim().is_empty())
}

pub trait Classifier: Send + Sync {
    fn classify(&self, brief: &TaskBrief<'_>) -> Result<TaskType>;
}

pub trait Generator: Send + Sync {
    fn generate_code(&self, brief: &TaskBrief<'_>) -> Result<GeneratedCode>;

    fn generate_answer(&self, brief: &TaskBrief<'_>) -> Result<String>;

    /// Propose a fix for `code` given the failure report of its last run.
    fn repair_code(&self, brief: &TaskBrief<'_>, code: &str, failure: &str)
    -> Result<GeneratedCode>;
}

pub trait InfoProbe: Send + Sync {
    /// Code that prints missing information, or `None` when enough is known.
    fn probe(&self, brief: &TaskBrief<'_>) -> Result<Option<String>>;

    fn repair_probe(&self, brief: &TaskBrief<'_>, code: &str, failure: &str) -> Result<String>;
}

/// Everything the task executor needs from an agent.
pub trait Agent: Classifier + Generator + InfoProbe {}

impl<T: Classifier + Generator + InfoProbe> Agent for T {}

/// Failures of an agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent command could not be started or exited non-zero.
    Command { reason: String },
    TimedOut { secs: u64 },
    /// The agent answered but not with the expected JSON or values.
    Unparseable { reason: String, excerpt: String },
    /// The agent answered with an empty payload where content was required.
    Empty { what: &'static str },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Command { reason } => write!(f, "agent command failed: {reason}"),
            AgentError::TimedOut { secs } => write!(f, "agent timed out after {secs}s"),
            AgentError::Unparseable { reason, excerpt } => {
                write!(f, "agent output is unusable ({reason}): {excerpt}")
            }
            AgentError::Empty { what } => write!(f, "agent returned an empty {what}"),
        }
    }
}

impl std::error::Error for AgentError {}

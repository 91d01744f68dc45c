//! Prompt rendering for agent invocations.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::agent::TaskBrief;

const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.md");
const PROBE_TEMPLATE: &str = include_str!("prompts/probe.md");
const PROBE_REPAIR_TEMPLATE: &str = include_str!("prompts/probe_repair.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");
const ANSWER_TEMPLATE: &str = include_str!("prompts/answer.md");

/// Which prompt to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Classify,
    Probe,
    ProbeRepair,
    Code,
    Repair,
    Answer,
}

impl PromptKind {
    fn template_name(self) -> &'static str {
        match self {
            PromptKind::Classify => "classify",
            PromptKind::Probe => "probe",
            PromptKind::ProbeRepair => "probe_repair",
            PromptKind::Code => "code",
            PromptKind::Repair => "repair",
            PromptKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct TaskView<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    visualization: bool,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("classify", CLASSIFY_TEMPLATE),
            ("probe", PROBE_TEMPLATE),
            ("probe_repair", PROBE_REPAIR_TEMPLATE),
            ("code", CODE_TEMPLATE),
            ("repair", REPAIR_TEMPLATE),
            ("answer", ANSWER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("bundled prompt templates should be valid");
        }
        Self { env }
    }

    /// Render `kind` for `brief`. `code` and `failure` are only used by repair prompts.
    pub fn render(
        &self,
        kind: PromptKind,
        brief: &TaskBrief<'_>,
        code: Option<&str>,
        failure: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template(kind.template_name())?;
        let task = TaskView {
            id: brief.node_id,
            title: brief.title,
            description: brief.description.trim(),
            visualization: brief.visualization,
        };
        let rendered = template.render(context! {
            task => task,
            context => non_empty(brief.context),
            gathered => non_empty(brief.gathered_info),
            data => non_empty(brief.data_summary),
            code => code.map(str::trim_end),
            failure => failure.map(str::trim),
        })?;
        Ok(rendered)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

//! Markdown run report with one section per visualization-bearing node.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::core::classifier::chart_files;
use crate::core::types::{NodeExecutionRecord, RunStats};

/// Appends report sections in completion order and closes with a summary.
#[derive(Debug)]
pub struct ReportAggregator {
    path: PathBuf,
    sections: usize,
}

impl ReportAggregator {
    /// Create `report_<plan_id>_<timestamp>.md` in `output_dir` with the run header.
    pub fn create(
        output_dir: &Path,
        plan_id: &str,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("create directory {}", output_dir.display()))?;
        let path = output_dir.join(format!(
            "report_{plan_id}_{}.md",
            started_at.format("%Y%m%d_%H%M%S")
        ));
        let header = format!(
            "# {title}\n\nPlan `{plan_id}`, started {}.\n",
            started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        fs::write(&path, header).with_context(|| format!("write report {}", path.display()))?;
        Ok(Self { path, sections: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sections(&self) -> usize {
        self.sections
    }

    /// Whether `record` belongs in the report.
    pub fn wants(record: &NodeExecutionRecord) -> bool {
        record.has_visualization || !chart_files(&record.generated_files).is_empty()
    }

    /// Append a section for `record` if it carries a visualization. Returns whether
    /// a section was written.
    pub fn append(
        &mut self,
        node_id: &str,
        node_title: &str,
        record: &NodeExecutionRecord,
    ) -> Result<bool> {
        if !Self::wants(record) {
            return Ok(false);
        }
        self.write(&render_section(node_id, node_title, record))?;
        self.sections += 1;
        debug!(node_id, sections = self.sections, "report section appended");
        Ok(true)
    }

    /// Append the summary table and close timestamp.
    pub fn finalize(
        mut self,
        stats: &RunStats,
        cancelled: bool,
        completed_at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let mut summary = String::from("\n## Summary\n\n| Status | Nodes |\n| --- | ---: |\n");
        summary.push_str(&format!("| Total | {} |\n", stats.total));
        summary.push_str(&format!("| Completed | {} |\n", stats.completed));
        summary.push_str(&format!("| Failed | {} |\n", stats.failed));
        summary.push_str(&format!("| Skipped | {} |\n", stats.skipped));
        if stats.pending > 0 {
            summary.push_str(&format!("| Not run | {} |\n", stats.pending));
        }
        if cancelled {
            summary.push_str("\nThe run was cancelled before every node finished.\n");
        }
        summary.push_str(&format!(
            "\n_Report closed {}._\n",
            completed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        self.write(&summary)?;
        Ok(self.path)
    }

    fn write(&mut self, text: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open report {}", self.path.display()))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("append report {}", self.path.display()))
    }
}

fn render_section(node_id: &str, node_title: &str, record: &NodeExecutionRecord) -> String {
    let mut section = format!(
        "\n## {node_title} (`{node_id}`)\n\n_Completed {}._\n",
        record
            .completed_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let purpose = record
        .visualization_purpose
        .as_deref()
        .or(record.code_description.as_deref());
    if let Some(purpose) = purpose.filter(|p| !p.trim().is_empty()) {
        section.push_str(&format!("\n**Purpose.** {}\n", purpose.trim()));
    }
    let charts = chart_files(&record.generated_files);
    if !charts.is_empty() {
        section.push('\n');
        for chart in charts {
            let name = Path::new(chart)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| chart.to_string());
            section.push_str(&format!("![{name}]({chart})\n"));
        }
    }
    if let Some(analysis) = record
        .visualization_analysis
        .as_deref()
        .filter(|a| !a.trim().is_empty())
    {
        section.push_str(&format!("\n**Analysis.** {}\n", analysis.trim()));
    }
    section
}

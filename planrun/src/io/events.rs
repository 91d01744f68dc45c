//! Progress events emitted on every node transition.
//!
//! Events are product output (an append-only `events.jsonl` per plan), separate
//! from `tracing` diagnostics. Sinks never fail the run: write errors are logged.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::plan::NodeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    NodeStarted,
    Classified,
    InfoGathered,
    SandboxRun,
    Repairing,
    NodeFinished,
    NodeSkipped,
    RunCancelled,
    RunFinished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn plan(plan_id: &str, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            node_id: None,
            kind,
            status: None,
            attempt: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn node(plan_id: &str, node_id: &str, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            ..Self::plan(plan_id, kind, message)
        }
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &ProgressEvent) {
        if let Err(err) = self.append(event) {
            warn!(err = %err, "failed to record progress event");
        }
    }
}

/// One line per node outcome on stderr, for interactive runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn emit(&self, event: &ProgressEvent) {
        let node = event.node_id.as_deref().unwrap_or("-");
        match event.kind {
            EventKind::NodeStarted
            | EventKind::NodeFinished
            | EventKind::NodeSkipped
            | EventKind::RunCancelled
            | EventKind::RunFinished => {
                let status = event.status.map(|s| s.as_str()).unwrap_or("");
                eprintln!("[{}] {node} {status} {}", event.plan_id, event.message);
            }
            _ => {}
        }
    }
}

/// Forwards every event to each inner sink in order.
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Read back an event log; blank lines are ignored.
pub fn read_events(path: &Path) -> Result<Vec<ProgressEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), i + 1))
        })
        .collect()
}

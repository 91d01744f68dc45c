//! Metadata summary of the input data directory, rendered into agent prompts.
//!
//! Only the head of each file is read. Generated code still reads the data
//! mount itself.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::context::truncate_chars;

/// Bytes read from the head of each file for type detection and preview.
const HEAD_BYTES: u64 = 8192;
const PREVIEW_LINES: usize = 5;
const BINARY_PREVIEW_BYTES: usize = 32;
const MAX_COLUMNS: usize = 20;

/// What a data file looks like from its first few kilobytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFormat {
    /// Delimited text with a header row.
    Table { delimiter: char, columns: Vec<String> },
    Text,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileMeta {
    /// Path relative to the data directory.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: DataFormat,
    /// First lines of text files, or a hex dump of the first bytes of binary files.
    pub preview: String,
}

/// Describe every regular file under `dir`, sorted by path. A missing directory has no files.
pub fn describe_data_dir(dir: &Path) -> Result<Vec<DataFileMeta>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let size_bytes = entry
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let head = read_head(path)?;
        let (format, preview) = inspect(path, &head);
        files.push(DataFileMeta {
            path: path.strip_prefix(dir).unwrap_or(path).to_path_buf(),
            size_bytes,
            format,
            preview,
        });
    }
    debug!(dir = %dir.display(), files = files.len(), "described data directory");
    Ok(files)
}

/// Markdown summary of `files`, capped at `limit_chars`.
pub fn render_data_summary(files: &[DataFileMeta], limit_chars: usize) -> String {
    let mut out = String::new();
    for file in files {
        let _ = writeln!(
            out,
            "### /data/{} ({})",
            file.path.display(),
            human_size(file.size_bytes)
        );
        match &file.format {
            DataFormat::Table { delimiter, columns } => {
                let shown = columns.len().min(MAX_COLUMNS);
                let _ = write!(
                    out,
                    "Delimited text ({}), {} column(s): {}",
                    delimiter_name(*delimiter),
                    columns.len(),
                    columns[..shown].join(", ")
                );
                if columns.len() > shown {
                    let _ = write!(out, ", ... ({} more)", columns.len() - shown);
                }
                out.push('\n');
            }
            DataFormat::Text => out.push_str("Text file\n"),
            DataFormat::Binary => out.push_str("Binary file\n"),
        }
        if !file.preview.is_empty() {
            let _ = writeln!(out, "```\n{}\n```", file.preview.trim_end());
        }
        out.push('\n');
    }
    truncate_chars(out.trim_end(), limit_chars)
}

/// Describe and render `dir` in one step.
pub fn summarize_data_dir(dir: &Path, limit_chars: usize) -> Result<String> {
    let files = describe_data_dir(dir)?;
    Ok(render_data_summary(&files, limit_chars))
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut head = Vec::new();
    file.take(HEAD_BYTES)
        .read_to_end(&mut head)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(head)
}

fn inspect(path: &Path, head: &[u8]) -> (DataFormat, String) {
    let Some(text) = head_text(head) else {
        return (DataFormat::Binary, hex_preview(head));
    };
    let lines: Vec<&str> = text.lines().take(PREVIEW_LINES).collect();
    let preview = lines.join("\n");
    let format = match (delimiter_for(path), lines.first()) {
        (Some(delimiter), Some(header)) if !header.trim().is_empty() => DataFormat::Table {
            delimiter,
            columns: header
                .split(delimiter)
                .map(|column| column.trim().trim_matches('"').to_string())
                .collect(),
        },
        _ => DataFormat::Text,
    };
    (format, preview)
}

/// Decode `head` as UTF-8, tolerating a character cut off at the read boundary.
fn head_text(head: &[u8]) -> Option<&str> {
    if head.contains(&0) {
        return None;
    }
    match std::str::from_utf8(head) {
        Ok(text) => Some(text),
        Err(err) if err.error_len().is_none() => std::str::from_utf8(&head[..err.valid_up_to()]).ok(),
        Err(_) => None,
    }
}

fn delimiter_for(path: &Path) -> Option<char> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "csv" => Some(','),
        "tsv" | "tab" => Some('\t'),
        _ => None,
    }
}

fn delimiter_name(delimiter: char) -> &'static str {
    match delimiter {
        ',' => "comma",
        '\t' => "tab",
        _ => "custom",
    }
}

fn hex_preview(head: &[u8]) -> String {
    head.iter()
        .take(BINARY_PREVIEW_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn human_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

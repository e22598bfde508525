//! Report formatting and persistence for the ranked parcels.
//!
//! Supports the plain-text report, CSV, and pretty JSON. Files are written
//! to a temporary sibling and renamed into place, so a failed run never
//! leaves a truncated report behind.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::score::ScoredParcel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

/// Flat row used for the CSV and JSON exports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub rank: usize,
    pub score: f64,
    pub parcel_id: String,
    pub address: String,
    pub neighborhood: String,
    pub nov_count: u64,
    pub complaint_count: u64,
    pub tract_311_count: u64,
    pub tract_id: Option<String>,
    pub vacant: Option<bool>,
}

impl ReportRow {
    pub fn new(rank: usize, p: &ScoredParcel) -> Self {
        let r = &p.record;
        Self {
            rank,
            score: p.score,
            parcel_id: r.parcel_id.to_string(),
            address: r.address.clone(),
            neighborhood: r.neighborhood.clone(),
            nov_count: r.nov_count,
            complaint_count: r.complaint_count,
            tract_311_count: r.tract_311_count,
            tract_id: r.tract_id.as_ref().map(|t| t.to_string()),
            vacant: r.vacant,
        }
    }
}

/// One report line; `rank` is 1-based.
pub fn format_line(rank: usize, p: &ScoredParcel) -> String {
    let r = &p.record;
    format!(
        "{}. Score {:.2} | {} | {} | {} | NOVs: {} | Complaints: {} | 311: {}",
        rank,
        p.score,
        r.parcel_id,
        r.address,
        r.neighborhood,
        r.nov_count,
        r.complaint_count,
        r.tract_311_count
    )
}

pub fn render_text(selected: &[ScoredParcel]) -> String {
    let mut out = String::new();
    for (i, p) in selected.iter().enumerate() {
        out.push_str(&format_line(i + 1, p));
        out.push('\n');
    }
    out
}

pub fn render_csv(selected: &[ScoredParcel]) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
    for (i, p) in selected.iter().enumerate() {
        writer.serialize(ReportRow::new(i + 1, p))?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish CSV buffer: {}", e.error()))
}

pub fn render_json(selected: &[ScoredParcel]) -> Result<Vec<u8>> {
    let rows: Vec<ReportRow> = selected
        .iter()
        .enumerate()
        .map(|(i, p)| ReportRow::new(i + 1, p))
        .collect();
    Ok(serde_json::to_vec_pretty(&rows)?)
}

pub fn render(selected: &[ScoredParcel], format: ReportFormat) -> Result<Vec<u8>> {
    match format {
        ReportFormat::Text => Ok(render_text(selected).into_bytes()),
        ReportFormat::Csv => render_csv(selected),
        ReportFormat::Json => render_json(selected),
    }
}

/// Renders the whole report, then atomically replaces `path` with it.
pub fn write_report(path: &str, selected: &[ScoredParcel], format: ReportFormat) -> Result<()> {
    let body = render(selected, format)?;
    let target = Path::new(path);
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_sibling(target);
    debug!(path, tmp = %tmp.display(), bytes = body.len(), "Writing report");
    fs::write(&tmp, &body).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to move report into {path}"));
    }

    info!(path, rows = selected.len(), ?format, "Report written");
    Ok(())
}

fn temp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "report".into());
    name.push(".tmp");
    target.with_file_name(name)
}

/// The first `n` report lines.
pub fn preview_lines(selected: &[ScoredParcel], n: usize) -> Vec<String> {
    selected
        .iter()
        .take(n)
        .enumerate()
        .map(|(i, p)| format_line(i + 1, p))
        .collect()
}

/// Logs the first `n` report lines.
pub fn log_preview(selected: &[ScoredParcel], n: usize) {
    for line in preview_lines(selected, n) {
        info!("{line}");
    }
}

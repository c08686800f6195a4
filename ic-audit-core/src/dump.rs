//! Exports of the audit store for offline analysis
//!
//! Two formats are produced:
//! - a pretty-printed JSON document `project_name -> [event, ...]`, optionally
//!   restricted to a trailing time window (default: last 30 hours)
//! - a compact, human-readable text dump with events sorted by timestamp
//!
//! Both work on a copy of the trails and never touch the store itself.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::config::DumpConfig;
use crate::error::Result;
use crate::types::{unix_now, AuditTrails, Envelope};

/// Time range a dump covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpWindow {
    /// Events no older than the given duration
    Trailing(Duration),
    /// Every stored event
    All,
}

impl DumpWindow {
    /// Whether an event stamped `timestamp` belongs in a dump taken at `now`.
    pub fn contains(&self, now: f64, timestamp: f64) -> bool {
        match self {
            DumpWindow::Trailing(window) => now - timestamp <= window.as_secs_f64(),
            DumpWindow::All => true,
        }
    }
}

/// Outcome of writing a dump file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub path: PathBuf,
    pub projects: usize,
    pub events: usize,
}

/// Restrict every trail to `window` relative to `now`.
///
/// All projects are kept, possibly with an empty list, and arrival order is
/// preserved.
pub fn filter_window(trails: &AuditTrails, now: f64, window: DumpWindow) -> AuditTrails {
    trails
        .iter()
        .map(|(project, events)| {
            let kept = events
                .iter()
                .filter(|e| window.contains(now, e.timestamp))
                .cloned()
                .collect();
            (project.clone(), kept)
        })
        .collect()
}

/// Writes dump files to the configured locations.
#[derive(Debug, Clone)]
pub struct Dumper {
    config: DumpConfig,
}

impl Dumper {
    pub fn new(config: DumpConfig) -> Self {
        Self { config }
    }

    /// Configured trailing window
    pub fn default_window(&self) -> DumpWindow {
        DumpWindow::Trailing(self.config.window())
    }

    /// Write the JSON dump for `window` as of now.
    pub fn write_json(&self, trails: &AuditTrails, window: DumpWindow) -> Result<DumpReport> {
        self.write_json_at(trails, window, unix_now())
    }

    /// Write the JSON dump for `window` as of `now`, overwriting any earlier dump.
    pub fn write_json_at(
        &self,
        trails: &AuditTrails,
        window: DumpWindow,
        now: f64,
    ) -> Result<DumpReport> {
        let filtered = filter_window(trails, now, window);
        let path = self.config.path.clone();

        let mut writer = create_output(&path)?;
        serde_json::to_writer_pretty(&mut writer, &filtered)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        let report = DumpReport {
            path,
            projects: filtered.len(),
            events: filtered.values().map(Vec::len).sum(),
        };
        tracing::info!(
            path = %report.path.display(),
            projects = report.projects,
            events = report.events,
            ?window,
            "Audit trails dumped"
        );
        Ok(report)
    }

    /// Write the compact text dump, limited to `project_filters` when non-empty.
    pub fn write_compact(
        &self,
        trails: &AuditTrails,
        project_filters: &[String],
    ) -> Result<DumpReport> {
        let selected = select_projects(trails, project_filters);
        let text = render_compact(&selected, Local::now());
        let path = self.config.compact_path.clone();

        let mut writer = create_output(&path)?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;

        let report = DumpReport {
            path,
            projects: selected.len(),
            events: selected.values().map(Vec::len).sum(),
        };
        tracing::info!(
            path = %report.path.display(),
            projects = report.projects,
            filtered = !project_filters.is_empty(),
            "Compact audit dump created"
        );
        Ok(report)
    }
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn select_projects(trails: &AuditTrails, project_filters: &[String]) -> AuditTrails {
    trails
        .iter()
        .filter(|(project, _)| {
            project_filters.is_empty() || project_filters.iter().any(|f| f == *project)
        })
        .map(|(project, events)| (project.clone(), events.clone()))
        .collect()
}

/// Render trails as the compact text format.
pub fn render_compact(trails: &AuditTrails, generated_at: DateTime<Local>) -> String {
    let mut out = format!(
        "AUDIT SERVER COMPACT DUMP ({})\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    );

    for (project, events) in trails {
        let mut sorted: Vec<&Envelope> = events.iter().collect();
        sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let _ = writeln!(out, "{}", "=".repeat(40));
        let _ = writeln!(out, "Project: {}", project);
        let _ = writeln!(out, "{}", "-".repeat(40));
        for event in sorted {
            out.push('\n');
            render_event(&mut out, event);
        }
    }

    out
}

fn render_event(out: &mut String, event: &Envelope) {
    let _ = writeln!(out, "event_type: {}", event.event_type);
    let _ = writeln!(out, "event_description: {}", event.event_description);
    let _ = writeln!(out, "timestamp: {}", event.local_time_label());
    let _ = writeln!(out, "project_name: {}", event.project_name);
    let _ = writeln!(out, "project_market: {}", event.project_market);
    let _ = writeln!(out, "project_description: {}", event.project_description);
    let _ = writeln!(
        out,
        "project_privileges: [{}]",
        event.project_privileges.join(", ")
    );
    for (key, value) in &event.extra_fields {
        let _ = writeln!(out, "{}: {}", key, value);
    }
}

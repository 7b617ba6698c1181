//! Run reports: flat summary rows, file export and console output.
//!
//! A report lands in `<root>/task_summary/<YYYYmmddHHMMSS>/` and holds the
//! summary in one of three formats plus three SVG charts:
//! - `task_timeline.svg`: tasks ranked by elapsed time
//! - `task_status.svg`: task count per status
//! - `task_memory_usage.svg`: tasks ranked by memory delta

use chrono::Local;
use handlebars::{html_escape, Handlebars};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::core::errors::{ConveyorError, Result};
use crate::task::model::{Task, TaskId, TaskStatus};

/// One task as it appears in summaries and reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub task_id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub elapsed_secs: Option<f64>,
    pub memory_mb: Option<f64>,
    pub result: Option<Value>,
    pub cancelled: bool,
    pub group: Option<String>,
    pub tags: Vec<String>,
}

impl From<&Task> for SummaryRow {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            elapsed_secs: task.elapsed_secs,
            memory_mb: task.memory_mb,
            result: task.result.clone(),
            cancelled: task.is_cancelled(),
            group: task.group.clone(),
            tags: task.tags.iter().cloned().collect(),
        }
    }
}

/// Criteria for `filter_summary`. Every criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryFilter {
    pub status: Option<TaskStatus>,
    pub group: Option<String>,
    pub tag: Option<String>,
}

impl SummaryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.group.is_none() && self.tag.is_none()
    }

    pub fn matches(&self, row: &SummaryRow) -> bool {
        self.status.map_or(true, |status| row.status == status)
            && self
                .group
                .as_deref()
                .map_or(true, |group| row.group.as_deref() == Some(group))
            && self
                .tag
                .as_deref()
                .map_or(true, |tag| row.tags.iter().any(|t| t == tag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    Json,
    Html,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
            ReportFormat::Html => "html",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            "html" => Ok(ReportFormat::Html),
            other => Err(ConveyorError::configuration_field(
                format!("unknown report format '{}'", other),
                "format",
                "csv | json | html",
                other,
            )),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Everything a sink needs to render one report
#[derive(Debug, Clone)]
pub struct ReportData {
    /// Backend label, e.g. `thread`
    pub mode: String,
    /// Rows written to the summary file, already filtered
    pub rows: Vec<SummaryRow>,
    /// Every task of the run; the charts always cover all of them
    pub all_rows: Vec<SummaryRow>,
    pub status_counts: BTreeMap<TaskStatus, usize>,
    pub group_counts: BTreeMap<String, usize>,
    pub tag_counts: BTreeMap<String, usize>,
}

/// Destination of run reports
pub trait ReportSink {
    /// Persist the report, returning the directory written to
    fn write(&self, data: &ReportData, format: ReportFormat) -> Result<PathBuf>;
}

/// Writes reports below a root directory
#[derive(Debug, Clone)]
pub struct FileReporter {
    root: PathBuf,
}

impl FileReporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self) -> PathBuf {
        self.root
            .join("task_summary")
            .join(Local::now().format("%Y%m%d%H%M%S").to_string())
    }
}

impl ReportSink for FileReporter {
    fn write(&self, data: &ReportData, format: ReportFormat) -> Result<PathBuf> {
        let dir = self.run_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| ConveyorError::io(format!("create {}", dir.display()), e))?;

        let body = match format {
            ReportFormat::Csv => to_csv(&data.rows)?,
            ReportFormat::Json => serde_json::to_string_pretty(&data.rows)?,
            ReportFormat::Html => to_html(&data.mode, &data.rows)?,
        };
        write_file(&dir.join(format!("task_summary.{}", format.extension())), &body)?;

        let durations: Vec<(String, f64)> = data
            .all_rows
            .iter()
            .map(|row| (row.name.clone(), row.elapsed_secs.unwrap_or(0.0)))
            .collect();
        let memory: Vec<(String, f64)> = data
            .all_rows
            .iter()
            .map(|row| (row.name.clone(), row.memory_mb.unwrap_or(0.0)))
            .collect();
        let statuses: Vec<(String, f64)> = data
            .status_counts
            .iter()
            .map(|(status, count)| (status.to_string(), *count as f64))
            .collect();

        write_file(
            &dir.join("task_timeline.svg"),
            &bar_chart("Task duration", "seconds", ranked(durations), "#4c72b0"),
        )?;
        write_file(
            &dir.join("task_status.svg"),
            &bar_chart("Task status", "tasks", statuses, "#55a868"),
        )?;
        write_file(
            &dir.join("task_memory_usage.svg"),
            &bar_chart("Task memory", "MB", ranked(memory), "#dd8452"),
        )?;

        tracing::info!(path = %dir.display(), format = %format, rows = data.rows.len(), "report written");
        Ok(dir)
    }
}

fn write_file(path: &Path, body: &str) -> Result<()> {
    std::fs::write(path, body).map_err(|e| ConveyorError::io(format!("write {}", path.display()), e))
}

fn format_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_default()
}

fn format_result(value: &Option<Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn to_csv(rows: &[SummaryRow]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "task_id",
        "name",
        "status",
        "elapsed_secs",
        "memory_mb",
        "result",
        "cancelled",
        "group",
        "tags",
    ])?;
    for row in rows {
        wtr.write_record([
            row.task_id.as_str(),
            &row.name,
            row.status.as_str(),
            &format_opt(row.elapsed_secs),
            &format_opt(row.memory_mb),
            &format_result(&row.result),
            if row.cancelled { "true" } else { "false" },
            row.group.as_deref().unwrap_or(""),
            &row.tags.join(";"),
        ])?;
    }
    let data = wtr
        .into_inner()
        .map_err(|e| ConveyorError::report(format!("flush csv writer: {}", e)))?;
    String::from_utf8(data).map_err(|e| ConveyorError::report(format!("csv is not utf-8: {}", e)))
}

const SUMMARY_TEMPLATE: &str = r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><title>Task summary ({{mode}})</title></head><body>
<table border="1">
<tr><th>task_id</th><th>name</th><th>status</th><th>elapsed_secs</th><th>memory_mb</th><th>result</th><th>cancelled</th><th>group</th><th>tags</th></tr>
{{#each rows}}
<tr><td>{{task_id}}</td><td>{{name}}</td><td>{{status}}</td><td>{{elapsed_secs}}</td><td>{{memory_mb}}</td><td>{{result}}</td><td>{{cancelled}}</td><td>{{group}}</td><td>{{tags}}</td></tr>
{{/each}}
</table>
</body></html>
"#;

/// Row as rendered into the HTML table
#[derive(Serialize)]
struct HtmlRow<'a> {
    task_id: &'a str,
    name: &'a str,
    status: &'static str,
    elapsed_secs: String,
    memory_mb: String,
    result: String,
    cancelled: bool,
    group: &'a str,
    tags: String,
}

#[derive(Serialize)]
struct HtmlSummary<'a> {
    mode: &'a str,
    rows: Vec<HtmlRow<'a>>,
}

fn to_html(mode: &str, rows: &[SummaryRow]) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);

    let summary = HtmlSummary {
        mode,
        rows: rows
            .iter()
            .map(|row| HtmlRow {
                task_id: row.task_id.as_str(),
                name: &row.name,
                status: row.status.as_str(),
                elapsed_secs: format_opt(row.elapsed_secs),
                memory_mb: format_opt(row.memory_mb),
                result: format_result(&row.result),
                cancelled: row.cancelled,
                group: row.group.as_deref().unwrap_or(""),
                tags: row.tags.join(";"),
            })
            .collect(),
    };
    handlebars
        .render_template(SUMMARY_TEMPLATE, &summary)
        .map_err(|e| ConveyorError::report(format!("render html summary: {}", e)))
}

fn ranked(mut bars: Vec<(String, f64)>) -> Vec<(String, f64)> {
    bars.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    bars
}

/// Horizontal bar chart
fn bar_chart(title: &str, unit: &str, bars: Vec<(String, f64)>, color: &str) -> String {
    const LABEL_WIDTH: f64 = 220.0;
    const PLOT_WIDTH: f64 = 480.0;
    const ROW: f64 = 24.0;
    const TOP: f64 = 40.0;

    let height = TOP + ROW * bars.len().max(1) as f64 + 30.0;
    let width = LABEL_WIDTH + PLOT_WIDTH + 100.0;
    let max = bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\" font-family=\"sans-serif\" font-size=\"12\">",
        w = width,
        h = height
    );
    let _ = writeln!(
        svg,
        "<text x=\"{}\" y=\"24\" font-size=\"16\" text-anchor=\"middle\">{} ({})</text>",
        width / 2.0,
        html_escape(title),
        html_escape(unit)
    );
    for (i, (label, value)) in bars.iter().enumerate() {
        let y = TOP + ROW * i as f64;
        let bar = if max > 0.0 { value / max * PLOT_WIDTH } else { 0.0 };
        let _ = writeln!(
            svg,
            "<text x=\"{}\" y=\"{}\" text-anchor=\"end\">{}</text>",
            LABEL_WIDTH - 8.0,
            y + ROW * 0.65,
            html_escape(label)
        );
        let _ = writeln!(
            svg,
            "<rect x=\"{}\" y=\"{}\" width=\"{:.1}\" height=\"{}\" fill=\"{}\"/>",
            LABEL_WIDTH,
            y + 3.0,
            bar.max(0.0),
            ROW - 6.0,
            color
        );
        let _ = writeln!(
            svg,
            "<text x=\"{:.1}\" y=\"{}\">{:.3}</text>",
            LABEL_WIDTH + bar.max(0.0) + 6.0,
            y + ROW * 0.65,
            value
        );
    }
    svg.push_str("</svg>\n");
    svg
}

/// Print a run report to stdout
pub fn print_console(data: &ReportData) {
    println!("===== Task report: {} =====", data.mode);
    println!("Total tasks: {}", data.all_rows.len());
    let statuses: Vec<String> = data
        .status_counts
        .iter()
        .map(|(status, count)| format!("{}={}", status, count))
        .collect();
    println!("By status: {}", statuses.join(", "));
    println!("By group: {:?}", data.group_counts);
    println!("By tag: {:?}", data.tag_counts);
    println!("--- Tasks ---");
    for row in &data.rows {
        println!(
            "{} | {} | {} | {}s | {}MB | {}{}",
            row.task_id,
            row.name,
            row.status,
            format_opt(row.elapsed_secs),
            format_opt(row.memory_mb),
            format_result(&row.result),
            if row.cancelled { " | cancelled" } else { "" }
        );
    }
}

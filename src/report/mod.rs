//! Baseline vs. treatment comparison
//!
//! # Design Principles (KISS)
//! - `delta% = (treatment - baseline) / |baseline| * 100`, sign kept as is
//! - A missing, zero or NaN baseline, or a missing treatment, gives
//!   `unavailable`, never a fabricated or infinite delta
//! - The improvement direction only drives the better/worse annotation

use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::common::BenchResult;
use crate::extract::MetricsRecord;

/// Rendered comparison table
pub const COMPARISON_TEXT: &str = "comparison.txt";
/// Combined machine-readable artifact
pub const COMPARISON_JSON: &str = "comparison.json";

/// Which way a metric improves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

/// A compared metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Throughput,
    Processed,
    CapacityUsed,
    StallCount,
    StallTime,
    PauseCount,
    PauseTime,
    WriteAmplification,
}

impl MetricKind {
    /// Every metric, in report order
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Throughput,
        MetricKind::Processed,
        MetricKind::CapacityUsed,
        MetricKind::StallCount,
        MetricKind::StallTime,
        MetricKind::PauseCount,
        MetricKind::PauseTime,
        MetricKind::WriteAmplification,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::Throughput => "Throughput",
            MetricKind::Processed => "Units processed",
            MetricKind::CapacityUsed => "Peak capacity used",
            MetricKind::StallCount => "Stalls",
            MetricKind::StallTime => "Stall time",
            MetricKind::PauseCount => "Pauses",
            MetricKind::PauseTime => "Pause time",
            MetricKind::WriteAmplification => "Write amplification",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MetricKind::Throughput | MetricKind::Processed => Direction::HigherIsBetter,
            _ => Direction::LowerIsBetter,
        }
    }

    pub fn value(&self, record: &MetricsRecord) -> Option<f64> {
        match self {
            MetricKind::Throughput => record.throughput,
            MetricKind::Processed => record.processed,
            MetricKind::CapacityUsed => record.capacity_used_bytes,
            MetricKind::StallCount => record.stall_count,
            MetricKind::StallTime => record.stall_secs,
            MetricKind::PauseCount => record.pause_count,
            MetricKind::PauseTime => record.pause_secs,
            MetricKind::WriteAmplification => record.write_amplification,
        }
    }

    /// Human-readable value with unit
    pub fn format(&self, value: Option<f64>) -> String {
        let Some(v) = value else {
            return "unavailable".to_string();
        };
        match self {
            MetricKind::Throughput => format!("{:.1} /s", v),
            MetricKind::Processed | MetricKind::StallCount | MetricKind::PauseCount => {
                format!("{:.0}", v)
            }
            MetricKind::CapacityUsed => format_bytes(v),
            MetricKind::StallTime | MetricKind::PauseTime => format!("{:.1} s", v),
            MetricKind::WriteAmplification => format!("{:.2}", v),
        }
    }
}

fn format_bytes(bytes: f64) -> String {
    if bytes >= 1_000_000_000.0 {
        format!("{:.2} GB", bytes / 1_000_000_000.0)
    } else if bytes >= 1_000_000.0 {
        format!("{:.2} MB", bytes / 1_000_000.0)
    } else if bytes >= 1_000.0 {
        format!("{:.2} KB", bytes / 1_000.0)
    } else {
        format!("{:.0} B", bytes)
    }
}

/// Signed percentage change from baseline to treatment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    Percent(f64),
    Unavailable,
}

impl Delta {
    pub fn compute(baseline: Option<f64>, treatment: Option<f64>) -> Self {
        match (baseline, treatment) {
            (Some(b), Some(t)) if b.is_finite() && b != 0.0 && t.is_finite() => {
                let percent = (t - b) / b.abs() * 100.0;
                if percent.is_finite() {
                    Delta::Percent(percent)
                } else {
                    Delta::Unavailable
                }
            }
            _ => Delta::Unavailable,
        }
    }

    /// `Some(true)` if the change is an improvement for `direction`
    pub fn is_improvement(&self, direction: Direction) -> Option<bool> {
        match *self {
            Delta::Percent(p) if p == 0.0 => None,
            Delta::Percent(p) => Some(match direction {
                Direction::HigherIsBetter => p > 0.0,
                Direction::LowerIsBetter => p < 0.0,
            }),
            Delta::Unavailable => None,
        }
    }
}

impl fmt::Display for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delta::Percent(p) => write!(f, "{:+.1}%", p),
            Delta::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// One aligned metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRow {
    pub metric: MetricKind,
    pub direction: Direction,
    pub baseline: Option<f64>,
    pub treatment: Option<f64>,
    pub delta: Delta,
}

/// Baseline and treatment records with per-metric deltas
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub baseline: MetricsRecord,
    pub treatment: MetricsRecord,
    pub rows: Vec<MetricRow>,
}

impl ComparisonReport {
    pub fn row(&self, metric: MetricKind) -> Option<&MetricRow> {
        self.rows.iter().find(|r| r.metric == metric)
    }
}

/// Align two records field by field
pub fn compare(baseline: &MetricsRecord, treatment: &MetricsRecord) -> ComparisonReport {
    let rows = MetricKind::ALL
        .iter()
        .map(|&metric| {
            let b = metric.value(baseline);
            let t = metric.value(treatment);
            MetricRow {
                metric,
                direction: metric.direction(),
                baseline: b,
                treatment: t,
                delta: Delta::compute(b, t),
            }
        })
        .collect();
    ComparisonReport {
        baseline: baseline.clone(),
        treatment: treatment.clone(),
        rows,
    }
}

/// Render the comparison as a fixed-width table
pub fn render(report: &ComparisonReport) -> String {
    let b = &report.baseline;
    let t = &report.treatment;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Placement comparison: {} ({} stream{}) vs {} ({} stream{})",
        b.trial_label,
        b.stream_count,
        if b.stream_count == 1 { "" } else { "s" },
        t.trial_label,
        t.stream_count,
        if t.stream_count == 1 { "" } else { "s" },
    );
    let _ = writeln!(
        out,
        "Counter source: {} / {}",
        b.counter_source, t.counter_source
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<22} {:>16} {:>16} {:>12}",
        "Metric", b.trial_label, t.trial_label, "Delta"
    );
    let _ = writeln!(out, "{}", "-".repeat(76));
    for row in &report.rows {
        let note = match row.delta.is_improvement(row.direction) {
            Some(true) => "  better",
            Some(false) => "  worse",
            None => "",
        };
        let _ = writeln!(
            out,
            "{:<22} {:>16} {:>16} {:>12}{}",
            row.metric.label(),
            row.metric.format(row.baseline),
            row.metric.format(row.treatment),
            row.delta.to_string(),
            note
        );
    }
    out
}

/// Write `comparison.txt` and `comparison.json` into `dir`
pub fn write_artifacts(report: &ComparisonReport, dir: &Path) -> BenchResult<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let text_path = dir.join(COMPARISON_TEXT);
    let mut text = render(report);
    for record in [&report.baseline, &report.treatment] {
        let _ = writeln!(text, "\n== {} ==", record.trial_label);
        text.push_str(&record.summary());
    }
    std::fs::write(&text_path, text)?;

    let json_path = dir.join(COMPARISON_JSON);
    std::fs::write(&json_path, serde_json::to_string_pretty(report)?)?;

    info!(
        text = %text_path.display(),
        json = %json_path.display(),
        "Comparison written"
    );
    Ok((text_path, json_path))
}

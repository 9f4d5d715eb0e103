//! Metrics extraction
//!
//! Assembles one `MetricsRecord` per trial from sources of uneven quality,
//! in order of preference:
//! 1. counters the reporting process wrote to its own log at graceful shutdown
//! 2. counters scraped from its live metrics endpoint just before shutdown
//! 3. nothing: every counter field is unavailable
//!
//! Extraction never fails. A missing field stays `None` and is written as
//! `unavailable`, so the comparison can show it as such instead of a zero.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{BenchError, BenchResult};
use crate::config::{CounterConfig, CounterKey};
use crate::supervisor::ShutdownOutcome;
use crate::telemetry::TelemetrySample;

/// File name of the machine-readable record inside a trial directory
pub const METRICS_FILE: &str = "metrics.env";
/// File name of the human-readable summary inside a trial directory
pub const SUMMARY_FILE: &str = "summary.txt";

const UNAVAILABLE: &str = "unavailable";

/// Where the counter fields of a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterSource {
    GracefulLog,
    LiveScrape,
    Unavailable,
}

impl CounterSource {
    fn as_str(&self) -> &'static str {
        match self {
            CounterSource::GracefulLog => "graceful_log",
            CounterSource::LiveScrape => "live_scrape",
            CounterSource::Unavailable => UNAVAILABLE,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "graceful_log" => Some(CounterSource::GracefulLog),
            "live_scrape" => Some(CounterSource::LiveScrape),
            UNAVAILABLE => Some(CounterSource::Unavailable),
            _ => None,
        }
    }
}

impl fmt::Display for CounterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Workload counters from one source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counters {
    pub processed: Option<f64>,
    pub stall_count: Option<f64>,
    pub stall_secs: Option<f64>,
    pub pause_count: Option<f64>,
    pub pause_secs: Option<f64>,
}

impl Counters {
    pub fn is_empty(&self) -> bool {
        self.processed.is_none()
            && self.stall_count.is_none()
            && self.stall_secs.is_none()
            && self.pause_count.is_none()
            && self.pause_secs.is_none()
    }
}

// =============================================================================
// Number parsing
// =============================================================================

/// Parse a count, tolerating `1,234,567` and `1_234_567`
pub fn parse_count(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a duration into seconds
///
/// Accepts bare seconds (`12.5`) and unit sequences such as `250ms`,
/// `1m30s`, `2h3m4.5s`, `800µs`.
pub fn parse_duration_secs(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(v) = parse_count(raw) {
        return Some(v);
    }
    let mut total = 0.0;
    let mut rest = raw;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        total += match &rest[..unit_len] {
            "ns" => value / 1e9,
            "us" | "µs" => value / 1e6,
            "ms" => value / 1e3,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
    }
    Some(total)
}

// =============================================================================
// Log counters
// =============================================================================

const COUNT_VALUE: &str = r"((?:[0-9]{1,3}(?:[,_][0-9]{3})+|[0-9]+)(?:\.[0-9]+)?)";
const DURATION_VALUE: &str = r"([0-9][0-9.]*(?:(?:ns|us|µs|ms|s|m|h)[0-9.]*)*)";

fn key_pattern(key: &str, value: &str) -> Option<Regex> {
    if key.is_empty() {
        return None;
    }
    let pattern = format!(
        r#"(?:^|[\s,;{{(\[])"?{}"?\s*[=:]\s*"?{}"#,
        regex::escape(key),
        value
    );
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(key, error = %e, "Unusable counter key");
            None
        }
    }
}

fn last_match(text: &str, key: &str, value: &str) -> Option<String> {
    let re = key_pattern(key, value)?;
    text.lines()
        .rev()
        .find_map(|line| re.captures_iter(line).last()?.get(1).map(|m| m.as_str().to_string()))
}

fn log_count(text: &str, key: &CounterKey) -> Option<f64> {
    last_match(text, &key.log, COUNT_VALUE).and_then(|v| parse_count(&v))
}

fn log_duration(text: &str, key: &CounterKey) -> Option<f64> {
    last_match(text, &key.log, DURATION_VALUE).and_then(|v| parse_duration_secs(&v))
}

/// Counters from `key=value` / `key: value` pairs in a process log
///
/// With a `graceful_marker`, only text from the last line containing the
/// marker onward counts, and a log without the marker yields nothing.
/// The last occurrence of each key wins.
pub fn parse_log_counters(log: &str, config: &CounterConfig) -> Counters {
    let text = match config.graceful_marker {
        Some(ref marker) if !marker.is_empty() => {
            let lines: Vec<&str> = log.lines().collect();
            match lines.iter().rposition(|l| l.contains(marker.as_str())) {
                Some(pos) => lines[pos..].join("\n"),
                None => return Counters::default(),
            }
        }
        _ => log.to_string(),
    };
    Counters {
        processed: log_count(&text, &config.processed),
        stall_count: log_count(&text, &config.stall_count),
        stall_secs: log_duration(&text, &config.stall_time),
        pause_count: log_count(&text, &config.pause_count),
        pause_secs: log_duration(&text, &config.pause_time),
    }
}

// =============================================================================
// Live scrape
// =============================================================================

/// Parse Prometheus text exposition, summing series across label sets
pub fn parse_prometheus(text: &str) -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, rest) = match line.find('{') {
            Some(open) => match line[open..].find('}') {
                Some(close) => (&line[..open], &line[open + close + 1..]),
                None => continue,
            },
            None => match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest),
                None => continue,
            },
        };
        let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        if value.is_finite() {
            *metrics.entry(name.trim().to_string()).or_insert(0.0) += value;
        }
    }
    metrics
}

/// Counters from a live metrics scrape
pub fn scrape_counters(text: &str, config: &CounterConfig) -> Counters {
    let metrics = parse_prometheus(text);
    let get = |key: &CounterKey| metrics.get(&key.scrape).copied();
    Counters {
        processed: get(&config.processed),
        stall_count: get(&config.stall_count),
        stall_secs: get(&config.stall_time),
        pause_count: get(&config.pause_count),
        pause_secs: get(&config.pause_time),
    }
}

// =============================================================================
// Metrics record
// =============================================================================

/// Canonical per-trial metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub trial_label: String,
    pub stream_count: u32,
    /// Measurement window the throughput is computed over
    pub elapsed_secs: f64,
    pub counter_source: CounterSource,
    pub processed: Option<f64>,
    /// Units processed per second
    pub throughput: Option<f64>,
    /// Peak bytes used on the volume
    pub capacity_used_bytes: Option<f64>,
    pub stall_count: Option<f64>,
    pub stall_secs: Option<f64>,
    pub pause_count: Option<f64>,
    pub pause_secs: Option<f64>,
    pub write_amplification: Option<f64>,
}

/// Everything a trial collected for extraction
#[derive(Debug, Clone)]
pub struct MetricSources<'a> {
    pub trial_label: &'a str,
    pub stream_count: u32,
    pub counters: &'a CounterConfig,
    /// Log of the reporting process, read after it stopped
    pub log_text: Option<String>,
    /// How the reporting process stopped
    pub shutdown_outcome: Option<ShutdownOutcome>,
    /// Live scrape taken before shutdown
    pub scrape_text: Option<String>,
    pub samples: &'a [TelemetrySample],
    /// Capacity read after shutdown
    pub final_capacity: Option<u64>,
    /// Write amplification read after shutdown
    pub final_write_amplification: Option<f64>,
    pub elapsed: Duration,
}

/// Build the record, choosing the best available counter source
pub fn extract(sources: &MetricSources<'_>) -> MetricsRecord {
    let label = sources.trial_label;
    let graceful = sources
        .log_text
        .as_deref()
        .map(|text| parse_log_counters(text, sources.counters))
        .unwrap_or_default();
    let flushed = sources
        .shutdown_outcome
        .is_some_and(|o| o.flushed_counters());

    let (counter_source, counters) = if flushed && !graceful.is_empty() {
        (CounterSource::GracefulLog, graceful)
    } else {
        if !flushed {
            warn!(
                trial = %label,
                outcome = ?sources.shutdown_outcome,
                "Graceful counters unavailable, falling back to live scrape"
            );
        } else {
            warn!(trial = %label, "No counters in process log, falling back to live scrape");
        }
        let scraped = sources
            .scrape_text
            .as_deref()
            .map(|text| scrape_counters(text, sources.counters))
            .unwrap_or_default();
        if scraped.is_empty() {
            warn!(trial = %label, "No live scrape counters either, counters unavailable");
            (CounterSource::Unavailable, Counters::default())
        } else {
            (CounterSource::LiveScrape, scraped)
        }
    };

    let elapsed_secs = sources.elapsed.as_secs_f64();
    let throughput = counters.processed.map(|p| p / elapsed_secs.max(1.0));

    let capacity_used_bytes = sources
        .samples
        .iter()
        .filter_map(|s| s.capacity_used)
        .chain(sources.final_capacity)
        .max()
        .map(|b| b as f64);

    let write_amplification = sources.final_write_amplification.or_else(|| {
        sources
            .samples
            .iter()
            .rev()
            .find_map(|s| s.write_amplification)
    });
    if write_amplification.is_none() {
        warn!(trial = %label, "Write amplification unavailable");
    }

    let record = MetricsRecord {
        trial_label: label.to_string(),
        stream_count: sources.stream_count,
        elapsed_secs,
        counter_source,
        processed: counters.processed,
        throughput,
        capacity_used_bytes,
        stall_count: counters.stall_count,
        stall_secs: counters.stall_secs,
        pause_count: counters.pause_count,
        pause_secs: counters.pause_secs,
        write_amplification,
    };
    info!(trial = %label, source = %record.counter_source, "Metrics extracted");
    record
}

fn opt(v: Option<f64>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => UNAVAILABLE.to_string(),
    }
}

fn parse_opt(key: &str, raw: &str) -> BenchResult<Option<f64>> {
    if raw == UNAVAILABLE || raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| BenchError::parse(format!("{}: not a number: '{}'", key, raw)))
}

impl MetricsRecord {
    /// `key=value` lines, `unavailable` for missing values
    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "trial_label={}", self.trial_label);
        let _ = writeln!(out, "stream_count={}", self.stream_count);
        let _ = writeln!(out, "elapsed_secs={}", self.elapsed_secs);
        let _ = writeln!(out, "counter_source={}", self.counter_source);
        for (key, value) in self.numeric_fields() {
            let _ = writeln!(out, "{}={}", key, opt(value));
        }
        out
    }

    fn numeric_fields(&self) -> [(&'static str, Option<f64>); 8] {
        [
            ("processed", self.processed),
            ("throughput", self.throughput),
            ("capacity_used_bytes", self.capacity_used_bytes),
            ("stall_count", self.stall_count),
            ("stall_secs", self.stall_secs),
            ("pause_count", self.pause_count),
            ("pause_secs", self.pause_secs),
            ("write_amplification", self.write_amplification),
        ]
    }

    /// Parse the output of `to_kv`; unknown keys and `#` comments are ignored
    pub fn from_kv(text: &str) -> BenchResult<Self> {
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim(), v.trim());
            }
        }
        let get = |key: &str| map.get(key).copied().unwrap_or(UNAVAILABLE);

        let trial_label = map
            .get("trial_label")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BenchError::parse("missing trial_label"))?
            .to_string();
        let stream_count = get("stream_count")
            .parse()
            .map_err(|_| BenchError::parse(format!("stream_count: '{}'", get("stream_count"))))?;
        let elapsed_secs = parse_opt("elapsed_secs", get("elapsed_secs"))?.unwrap_or(0.0);
        let counter_source =
            CounterSource::parse(get("counter_source")).unwrap_or(CounterSource::Unavailable);

        Ok(Self {
            trial_label,
            stream_count,
            elapsed_secs,
            counter_source,
            processed: parse_opt("processed", get("processed"))?,
            throughput: parse_opt("throughput", get("throughput"))?,
            capacity_used_bytes: parse_opt("capacity_used_bytes", get("capacity_used_bytes"))?,
            stall_count: parse_opt("stall_count", get("stall_count"))?,
            stall_secs: parse_opt("stall_secs", get("stall_secs"))?,
            pause_count: parse_opt("pause_count", get("pause_count"))?,
            pause_secs: parse_opt("pause_secs", get("pause_secs"))?,
            write_amplification: parse_opt("write_amplification", get("write_amplification"))?,
        })
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let fmt = |v: Option<f64>, unit: &str| match v {
            Some(v) => format!("{:.2}{}", v, unit),
            None => UNAVAILABLE.to_string(),
        };
        let mut out = String::new();
        let _ = writeln!(out, "Trial:               {}", self.trial_label);
        let _ = writeln!(out, "Streams:             {}", self.stream_count);
        let _ = writeln!(out, "Elapsed:             {:.1}s", self.elapsed_secs);
        let _ = writeln!(out, "Counter source:      {}", self.counter_source);
        let _ = writeln!(out, "Processed:           {}", fmt(self.processed, ""));
        let _ = writeln!(out, "Throughput:          {}", fmt(self.throughput, "/s"));
        let _ = writeln!(
            out,
            "Capacity used:       {}",
            fmt(self.capacity_used_bytes.map(|b| b / (1024.0 * 1024.0 * 1024.0)), " GiB")
        );
        let _ = writeln!(out, "Stalls:              {}", fmt(self.stall_count, ""));
        let _ = writeln!(out, "Stall time:          {}", fmt(self.stall_secs, "s"));
        let _ = writeln!(out, "Pauses:              {}", fmt(self.pause_count, ""));
        let _ = writeln!(out, "Pause time:          {}", fmt(self.pause_secs, "s"));
        let _ = writeln!(out, "Write amplification: {}", fmt(self.write_amplification, ""));
        out
    }

    /// Write `metrics.env` and `summary.txt` into `dir`
    pub fn persist(&self, dir: &Path) -> BenchResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_FILE);
        std::fs::write(&path, self.to_kv())?;
        std::fs::write(dir.join(SUMMARY_FILE), self.summary())?;
        Ok(path)
    }

    /// Read `metrics.env` from a trial directory
    pub fn load(dir: &Path) -> BenchResult<Self> {
        let path = dir.join(METRICS_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| BenchError::missing(format!("{}: {}", path.display(), e)))?;
        Self::from_kv(&text)
    }
}

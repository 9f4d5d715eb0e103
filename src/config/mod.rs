//! Configuration module for placement-bench
//!
//! Supports loading configuration from:
//! - TOML files (device, remote host, dataset, dependent processes)
//! - Environment variables / CLI flags (see `common::cli::EnvOverrides`)
//!
//! Every knob has a documented default so an empty file is a valid config.
//!
//! # Example
//! ```ignore
//! let config = BenchConfig::load("bench.toml")?;
//! let trial = TrialConfig::new(&config, TrialKind::Treatment);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{BenchError, BenchResult};
use crate::supervisor::Role;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Root directory for per-trial outputs and the comparison artifact
    pub output_dir: PathBuf,
    /// Steady-state duration after all processes are ready
    pub run_secs: u64,
    /// Readiness probe deadline per process
    pub ready_timeout_secs: u64,
    /// Readiness probe period
    pub ready_poll_ms: u64,
    /// Graceful shutdown wait before escalating to a forced kill
    pub shutdown_wait_secs: u64,
    /// How long to look for the real pid after a detached launch
    pub pid_discovery_secs: u64,
    /// Cache size handed to dependent processes (`{cache_mb}`, `BENCH_CACHE_MB`)
    pub cache_mb: u64,
    /// Well-known ports reclaimed after shutdown, in addition to per-process ports
    pub ports: Vec<u16>,
    pub device: DeviceConfig,
    pub remote: RemoteConfig,
    pub telemetry: TelemetryConfig,
    pub dataset: DatasetConfig,
    pub trial: TrialsConfig,
    /// Dependent processes in startup (dependency) order
    #[serde(rename = "process")]
    pub processes: Vec<ProcessConfig>,
    pub counters: CounterConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./results"),
            run_secs: 600,
            ready_timeout_secs: 300,
            ready_poll_ms: 1000,
            shutdown_wait_secs: 30,
            pid_discovery_secs: 15,
            cache_mb: 4096,
            ports: Vec::new(),
            device: DeviceConfig::default(),
            remote: RemoteConfig::default(),
            telemetry: TelemetryConfig::default(),
            dataset: DatasetConfig::default(),
            trial: TrialsConfig::default(),
            processes: Vec::new(),
            counters: CounterConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> BenchResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BenchError::missing(format!("config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> BenchResult<Self> {
        toml::from_str(content).map_err(|e| BenchError::config(e.to_string()))
    }

    /// Reject configurations no trial could run with
    pub fn validate(&self) -> BenchResult<()> {
        if self.dataset.chunk_size == 0 {
            return Err(BenchError::config("dataset.chunk_size must be positive"));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(BenchError::config("telemetry.interval_secs must be positive"));
        }
        for (kind, settings) in [
            (TrialKind::Baseline, &self.trial.baseline),
            (TrialKind::Treatment, &self.trial.treatment),
        ] {
            if settings.streams == 0 {
                return Err(BenchError::config(format!(
                    "trial.{}.streams must be positive",
                    kind
                )));
            }
        }
        if self.dataset.total_units > 0 {
            for (name, stage) in [
                ("fetch", &self.dataset.fetch),
                ("transform", &self.dataset.transform),
                ("load", &self.dataset.load),
            ] {
                match stage {
                    Some(t) if !t.program.is_empty() => {}
                    _ => {
                        return Err(BenchError::config(format!(
                            "dataset.{} is required when dataset.total_units > 0",
                            name
                        )))
                    }
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.processes {
            if p.name.is_empty() || p.program.is_empty() {
                return Err(BenchError::config("process entries need a name and a program"));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(BenchError::config(format!(
                    "duplicate process name '{}'",
                    p.name
                )));
            }
        }
        if let Some(ref name) = self.counters.process {
            if !self.processes.iter().any(|p| &p.name == name) {
                return Err(BenchError::config(format!(
                    "counters.process '{}' is not a configured process",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Process whose counters feed the metrics record
    pub fn reporting_process(&self) -> Option<&ProcessConfig> {
        match self.counters.process {
            Some(ref name) => self.processes.iter().find(|p| &p.name == name),
            None => self.processes.first(),
        }
    }

    /// All ports to reclaim after shutdown
    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .ports
            .iter()
            .chain(self.processes.iter().flat_map(|p| p.ports.iter()))
            .copied()
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

// =============================================================================
// Device / remote / telemetry
// =============================================================================

/// Block device and filesystem layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Block device node (e.g. "/dev/nvme1n1")
    pub path: PathBuf,
    pub mount_point: PathBuf,
    pub mkfs_program: String,
    /// Arguments for mkfs; `{device}` and `{streams}` are substituted
    pub mkfs_args: Vec<String>,
    /// Mount options; `{streams}` is substituted. Empty means no `-o`.
    pub mount_options: String,
    /// Storage tiers created under the mount point, each mapped to a stream
    pub tiers: Vec<String>,
    /// Drop the page cache on teardown
    pub drop_caches: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/nvme1n1"),
            mount_point: PathBuf::from("/mnt/placement-bench"),
            mkfs_program: "mkfs.f2fs".to_string(),
            mkfs_args: vec!["-f".to_string(), "{device}".to_string()],
            mount_options: "fdp_log_n={streams}".to_string(),
            tiers: vec!["hot".to_string(), "warm".to_string(), "cold".to_string()],
            drop_caches: true,
        }
    }
}

/// Remote host exposing device counters over ssh
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote host; telemetry is reported unavailable when unset
    pub host: Option<String>,
    pub user: Option<String>,
    pub ssh_program: String,
    pub connect_timeout_secs: u64,
    /// Upper bound for any single remote command
    pub command_timeout_secs: u64,
    /// Rolling log the remote side appends write-amplification figures to
    pub log_path: String,
    pub tail_lines: u32,
    /// Command resetting device-level counters
    pub reset_command: Option<String>,
    /// Command forcing a counter snapshot into the remote log
    pub snapshot_command: Option<String>,
}

impl RemoteConfig {
    /// The configured host, ignoring an empty string
    pub fn target_host(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            ssh_program: "ssh".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: 30,
            log_path: "/var/log/placement/waf.log".to_string(),
            tail_lines: 200,
            reset_command: None,
            snapshot_command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
    pub file_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            file_name: "telemetry.jsonl".to_string(),
        }
    }
}

// =============================================================================
// Dataset pipeline
// =============================================================================

/// External command with placeholder arguments
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Units (e.g. blocks) to push through the chunked pipeline; 0 disables it
    pub total_units: u64,
    pub chunk_size: u64,
    /// Scratch directory for the transient chunk files
    pub staging_dir: PathBuf,
    /// Download `[start, end)` into `{download}`
    pub fetch: Option<CommandTemplate>,
    /// Convert `{download}` into `{artifact}`
    pub transform: Option<CommandTemplate>,
    /// Ingest `{artifact}` into the store
    pub load: Option<CommandTemplate>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            total_units: 0,
            chunk_size: 100_000,
            staging_dir: PathBuf::from("/var/tmp/placement-bench/staging"),
            fetch: None,
            transform: None,
            load: None,
        }
    }
}

// =============================================================================
// Trials
// =============================================================================

/// Which configuration a trial runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialKind {
    Baseline,
    Treatment,
}

impl fmt::Display for TrialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialKind::Baseline => write!(f, "baseline"),
            TrialKind::Treatment => write!(f, "treatment"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrialSettings {
    /// Number of logical write streams the volume is mounted with
    pub streams: u32,
    /// Placement mode handed to dependent processes
    pub placement_mode: String,
    /// Extra environment for dependent processes in this trial
    pub env: BTreeMap<String, String>,
}

impl TrialSettings {
    fn with(streams: u32, placement_mode: &str) -> Self {
        Self {
            streams,
            placement_mode: placement_mode.to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self::with(1, "off")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrialsConfig {
    pub baseline: TrialSettings,
    pub treatment: TrialSettings,
}

impl Default for TrialsConfig {
    fn default() -> Self {
        Self {
            baseline: TrialSettings::with(1, "off"),
            treatment: TrialSettings::with(8, "placement"),
        }
    }
}

// =============================================================================
// Dependent processes and counters
// =============================================================================

/// When a dependent process is started relative to the dataset pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPhase {
    /// Running while chunks are loaded (e.g. a server the load step feeds)
    BeforePipeline,
    /// Started on the fully loaded store
    #[default]
    AfterPipeline,
}

/// One long-running dependent process
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub role: Role,
    pub program: String,
    #[serde(default)]
    pub start: StartPhase,
    /// Arguments; trial placeholders such as `{tier:hot}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pattern matched against the process table to find the detached pid
    #[serde(default)]
    pub pid_pattern: Option<String>,
    /// Health endpoint; the process counts as ready once it returns 2xx
    #[serde(default)]
    pub ready_url: Option<String>,
    /// Prometheus-style metrics endpoint scraped before shutdown
    #[serde(default)]
    pub metrics_url: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl ProcessConfig {
    /// Pattern used for pid discovery, defaulting to the program path
    pub fn pid_pattern(&self) -> &str {
        self.pid_pattern.as_deref().unwrap_or(&self.program)
    }
}

/// Names of one canonical counter in each source
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CounterKey {
    /// Key in `key=value` log lines written at graceful shutdown
    pub log: String,
    /// Metric name on the live metrics endpoint
    pub scrape: String,
}

impl CounterKey {
    fn new(log: &str, scrape: &str) -> Self {
        Self {
            log: log.to_string(),
            scrape: scrape.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Process whose counters are reported (default: first process)
    pub process: Option<String>,
    /// Only log lines at or after the last line containing this marker count
    pub graceful_marker: Option<String>,
    pub processed: CounterKey,
    pub stall_count: CounterKey,
    pub stall_time: CounterKey,
    pub pause_count: CounterKey,
    pub pause_time: CounterKey,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            process: None,
            graceful_marker: None,
            processed: CounterKey::new("processed", "bench_processed_total"),
            stall_count: CounterKey::new("stalls", "bench_stalls_total"),
            stall_time: CounterKey::new("stall_time", "bench_stall_seconds_total"),
            pause_count: CounterKey::new("pauses", "bench_pauses_total"),
            pause_time: CounterKey::new("pause_time", "bench_pause_seconds_total"),
        }
    }
}

// =============================================================================
// Per-trial derived configuration
// =============================================================================

/// Storage-tier directory mapped onto one placement stream
#[derive(Debug, Clone, PartialEq)]
pub struct StorageTier {
    pub name: String,
    pub dir: PathBuf,
    pub placement_id: u32,
}

/// Immutable configuration of one trial
#[derive(Debug, Clone)]
pub struct TrialConfig {
    pub kind: TrialKind,
    pub label: String,
    pub stream_count: u32,
    pub placement_mode: String,
    pub total_units: u64,
    pub chunk_size: u64,
    pub mount_point: PathBuf,
    pub tiers: Vec<StorageTier>,
    pub staging_dir: PathBuf,
    /// `<output_dir>/<label>`
    pub output_dir: PathBuf,
    pub cache_mb: u64,
    pub extra_env: BTreeMap<String, String>,
}

impl TrialConfig {
    pub fn new(config: &BenchConfig, kind: TrialKind) -> Self {
        let settings = match kind {
            TrialKind::Baseline => &config.trial.baseline,
            TrialKind::Treatment => &config.trial.treatment,
        };
        let label = kind.to_string();
        let stream_count = settings.streams.max(1);
        let mount_point = config.device.mount_point.clone();

        let tiers = config
            .device
            .tiers
            .iter()
            .enumerate()
            .map(|(i, name)| StorageTier {
                name: name.clone(),
                dir: mount_point.join(name),
                placement_id: i as u32 % stream_count,
            })
            .collect();

        Self {
            kind,
            output_dir: config.output_dir.join(&label),
            label,
            stream_count,
            placement_mode: settings.placement_mode.clone(),
            total_units: config.dataset.total_units,
            chunk_size: config.dataset.chunk_size,
            mount_point,
            tiers,
            staging_dir: config.dataset.staging_dir.clone(),
            cache_mb: config.cache_mb,
            extra_env: settings.env.clone(),
        }
    }

    pub fn tier(&self, name: &str) -> Option<&StorageTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Directory of the durable store the pipeline loads into
    pub fn store_dir(&self) -> PathBuf {
        self.tiers
            .first()
            .map(|t| t.dir.clone())
            .unwrap_or_else(|| self.mount_point.clone())
    }

    /// Substitute trial placeholders in a template string
    ///
    /// Recognised: `{label}`, `{mount}`, `{streams}`, `{placement}`,
    /// `{cache_mb}`, `{store}` and `{tier:NAME}`.
    pub fn expand(&self, template: &str) -> String {
        let mut out = template
            .replace("{label}", &self.label)
            .replace("{mount}", &self.mount_point.to_string_lossy())
            .replace("{streams}", &self.stream_count.to_string())
            .replace("{placement}", &self.placement_mode)
            .replace("{cache_mb}", &self.cache_mb.to_string())
            .replace("{store}", &self.store_dir().to_string_lossy());
        for tier in &self.tiers {
            out = out.replace(
                &format!("{{tier:{}}}", tier.name),
                &tier.dir.to_string_lossy(),
            );
        }
        out
    }

    /// Environment selecting storage tiers and placement mode
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("BENCH_TRIAL".to_string(), self.label.clone()),
            ("BENCH_PLACEMENT_MODE".to_string(), self.placement_mode.clone()),
            ("BENCH_STREAMS".to_string(), self.stream_count.to_string()),
            ("BENCH_CACHE_MB".to_string(), self.cache_mb.to_string()),
        ];
        for tier in &self.tiers {
            let key = tier.name.to_uppercase().replace('-', "_");
            env.push((
                format!("BENCH_TIER_{}_DIR", key),
                tier.dir.to_string_lossy().into_owned(),
            ));
            env.push((
                format!("BENCH_TIER_{}_PID", key),
                tier.placement_id.to_string(),
            ));
        }
        env.extend(
            self.extra_env
                .iter()
                .map(|(k, v)| (k.clone(), self.expand(v))),
        );
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
output_dir = "/srv/results"
run_secs = 1800
ports = [30303]

[device]
path = "/dev/nvme2n1"
mount_point = "/mnt/fdp"
tiers = ["hot", "cold"]

[remote]
host = "bench-host"
reset_command = "fdp-reset"

[dataset]
total_units = 1000
chunk_size = 300
fetch = { program = "fetch-blocks", args = ["{start}", "{end}", "{download}"] }
transform = { program = "convert", args = ["{download}", "{artifact}"] }
load = { program = "node", args = ["import", "{artifact}"] }

[trial.treatment]
streams = 4
placement_mode = "fdp"
env = { NODE_HINT = "{tier:cold}" }

[[process]]
name = "node"
role = "producer"
program = "/usr/local/bin/node"
args = ["--datadir", "{tier:hot}", "--cache", "{cache_mb}"]
ready_url = "http://127.0.0.1:8545/health"
ports = [8545]

[[process]]
name = "beacon"
role = "consumer"
program = "/usr/local/bin/beacon"
start = "before_pipeline"
pid_pattern = "beacon --datadir"
ports = [5052, 8545]
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BenchConfig::from_toml("").unwrap();
        assert_eq!(config.run_secs, 600);
        assert_eq!(config.shutdown_wait_secs, 30);
        assert_eq!(config.telemetry.interval_secs, 300);
        assert_eq!(config.trial.baseline.streams, 1);
        assert_eq!(config.trial.treatment.streams, 8);
        assert!(config.processes.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = BenchConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/srv/results"));
        assert_eq!(config.device.path, PathBuf::from("/dev/nvme2n1"));
        assert_eq!(config.remote.host.as_deref(), Some("bench-host"));
        assert_eq!(config.dataset.chunk_size, 300);
        assert_eq!(config.processes.len(), 2);
        assert_eq!(config.processes[1].role, Role::Consumer);
        assert_eq!(config.processes[1].start, StartPhase::BeforePipeline);
        assert_eq!(config.processes[0].start, StartPhase::AfterPipeline);
        assert_eq!(config.processes[1].pid_pattern(), "beacon --datadir");
        assert_eq!(config.processes[0].pid_pattern(), "/usr/local/bin/node");
        assert_eq!(config.reporting_process().unwrap().name, "node");
        assert_eq!(config.all_ports(), vec![5052, 8545, 30303]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = BenchConfig::default();
        config.dataset.chunk_size = 0;
        assert!(matches!(config.validate(), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_validate_requires_stages_for_dataset() {
        let mut config = BenchConfig::default();
        config.dataset.total_units = 10;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dataset.fetch"));
    }

    #[test]
    fn test_validate_rejects_unknown_counter_process() {
        let mut config = BenchConfig::from_toml(SAMPLE).unwrap();
        config.counters.process = Some("missing".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_process_names() {
        let mut config = BenchConfig::from_toml(SAMPLE).unwrap();
        config.processes[1].name = "node".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_trial_config_maps_tiers_to_streams() {
        let config = BenchConfig::from_toml(SAMPLE).unwrap();

        let baseline = TrialConfig::new(&config, TrialKind::Baseline);
        assert_eq!(baseline.label, "baseline");
        assert_eq!(baseline.stream_count, 1);
        assert!(baseline.tiers.iter().all(|t| t.placement_id == 0));
        assert_eq!(baseline.output_dir, PathBuf::from("/srv/results/baseline"));

        let treatment = TrialConfig::new(&config, TrialKind::Treatment);
        assert_eq!(treatment.stream_count, 4);
        assert_eq!(treatment.tier("hot").unwrap().placement_id, 0);
        assert_eq!(treatment.tier("cold").unwrap().placement_id, 1);
        assert_eq!(treatment.tier("cold").unwrap().dir, PathBuf::from("/mnt/fdp/cold"));
        assert_eq!(treatment.store_dir(), PathBuf::from("/mnt/fdp/hot"));
    }

    #[test]
    fn test_expand_placeholders() {
        let config = BenchConfig::from_toml(SAMPLE).unwrap();
        let trial = TrialConfig::new(&config, TrialKind::Treatment);
        assert_eq!(
            trial.expand("--datadir={tier:hot} --streams={streams} --mode={placement}"),
            "--datadir=/mnt/fdp/hot --streams=4 --mode=fdp"
        );
        assert_eq!(trial.expand("{cache_mb}MB"), "4096MB");
        assert_eq!(trial.expand("{unknown}"), "{unknown}");
    }

    #[test]
    fn test_process_env() {
        let config = BenchConfig::from_toml(SAMPLE).unwrap();
        let trial = TrialConfig::new(&config, TrialKind::Treatment);
        let env: BTreeMap<_, _> = trial.process_env().into_iter().collect();
        assert_eq!(env["BENCH_PLACEMENT_MODE"], "fdp");
        assert_eq!(env["BENCH_STREAMS"], "4");
        assert_eq!(env["BENCH_TIER_COLD_DIR"], "/mnt/fdp/cold");
        assert_eq!(env["BENCH_TIER_COLD_PID"], "1");
        assert_eq!(env["NODE_HINT"], "/mnt/fdp/cold");
    }
}

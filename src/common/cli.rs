//! CLI argument parsing for placement-bench
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Every config knob a trial is commonly tuned with has a `BENCH_*`
//!   environment variable, applied on top of the config file
//! - Subcommands map one-to-one onto library entry points

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::common::BenchResult;
use crate::config::BenchConfig;

/// placement-bench: A/B storage-placement benchmark orchestrator
#[derive(Parser, Debug, Clone)]
#[command(name = "placement-bench")]
#[command(about = "Reproducible A/B benchmark of storage placement on a bounded volume")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short = 'f', long = "config", env = "BENCH_CONFIG", global = true)]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: EnvOverrides,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Fetch a dataset range into the staging directory
    Fetch {
        /// First unit (inclusive)
        #[arg(long)]
        start: u64,
        /// Last unit (exclusive)
        #[arg(long)]
        end: u64,
    },

    /// Transform a previously fetched range into a loadable artifact
    Transform {
        #[arg(long)]
        start: u64,
        #[arg(long)]
        end: u64,
    },

    /// Run one or both trials
    Run {
        #[arg(value_enum, default_value_t = RunTarget::Both)]
        target: RunTarget,
    },

    /// Compare two persisted trial directories
    Compare {
        /// Directory holding the baseline metrics.env
        baseline: PathBuf,
        /// Directory holding the treatment metrics.env
        treatment: PathBuf,
    },

    /// Check binaries and the device node, then exit
    Check,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    Baseline,
    Treatment,
    Both,
}

/// Overrides for the config file, settable by flag or environment
#[derive(clap::Args, Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    /// Units pushed through the chunked pipeline
    #[arg(long, env = "BENCH_TOTAL_UNITS")]
    pub total_units: Option<u64>,

    #[arg(long, env = "BENCH_CHUNK_SIZE")]
    pub chunk_size: Option<u64>,

    /// Telemetry sampling interval in seconds
    #[arg(long, env = "BENCH_SAMPLE_INTERVAL_SECS")]
    pub sample_interval_secs: Option<u64>,

    /// Block device under test
    #[arg(long, env = "BENCH_DEVICE")]
    pub device: Option<PathBuf>,

    #[arg(long, env = "BENCH_MOUNT_POINT")]
    pub mount_point: Option<PathBuf>,

    /// Host exposing device counters over ssh
    #[arg(long, env = "BENCH_REMOTE_HOST")]
    pub remote_host: Option<String>,

    #[arg(long, env = "BENCH_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, env = "BENCH_STAGING_DIR")]
    pub staging_dir: Option<PathBuf>,

    #[arg(long, env = "BENCH_CACHE_MB")]
    pub cache_mb: Option<u64>,

    /// Steady-state duration in seconds
    #[arg(long, env = "BENCH_RUN_SECS")]
    pub run_secs: Option<u64>,

    #[arg(long, env = "BENCH_READY_TIMEOUT_SECS")]
    pub ready_timeout_secs: Option<u64>,

    #[arg(long, env = "BENCH_SHUTDOWN_WAIT_SECS")]
    pub shutdown_wait_secs: Option<u64>,

    #[arg(long, env = "BENCH_BASELINE_STREAMS")]
    pub baseline_streams: Option<u32>,

    #[arg(long, env = "BENCH_TREATMENT_STREAMS")]
    pub treatment_streams: Option<u32>,
}

impl EnvOverrides {
    /// Apply every set override to `config`
    pub fn apply(&self, config: &mut BenchConfig) {
        if let Some(v) = self.total_units {
            config.dataset.total_units = v;
        }
        if let Some(v) = self.chunk_size {
            config.dataset.chunk_size = v;
        }
        if let Some(v) = self.sample_interval_secs {
            config.telemetry.interval_secs = v;
        }
        if let Some(ref v) = self.device {
            config.device.path = v.clone();
        }
        if let Some(ref v) = self.mount_point {
            config.device.mount_point = v.clone();
        }
        if let Some(ref v) = self.remote_host {
            config.remote.host = Some(v.clone());
        }
        if let Some(ref v) = self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(ref v) = self.staging_dir {
            config.dataset.staging_dir = v.clone();
        }
        if let Some(v) = self.cache_mb {
            config.cache_mb = v;
        }
        if let Some(v) = self.run_secs {
            config.run_secs = v;
        }
        if let Some(v) = self.ready_timeout_secs {
            config.ready_timeout_secs = v;
        }
        if let Some(v) = self.shutdown_wait_secs {
            config.shutdown_wait_secs = v;
        }
        if let Some(v) = self.baseline_streams {
            config.trial.baseline.streams = v;
        }
        if let Some(v) = self.treatment_streams {
            config.trial.treatment.streams = v;
        }
    }
}

/// Point processes at different binaries via `BENCH_BIN_<NAME>`
///
/// `lookup` is `std::env::var` in the binary.
pub fn apply_binary_overrides<F>(config: &mut BenchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for process in &mut config.processes {
        let key = format!(
            "BENCH_BIN_{}",
            process.name.to_uppercase().replace(['-', '.'], "_")
        );
        if let Some(program) = lookup(&key).filter(|p| !p.is_empty()) {
            process.program = program;
        }
    }
}

impl Cli {
    /// Config file (or defaults), then overrides, then validation
    pub fn load_config(&self) -> BenchResult<BenchConfig> {
        let mut config = match self.config_file {
            Some(ref path) => BenchConfig::load(path)?,
            None => BenchConfig::default(),
        };
        self.overrides.apply(&mut config);
        apply_binary_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }
}

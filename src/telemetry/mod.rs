//! Background telemetry sampler
//!
//! Architecture:
//! - One tokio task per trial, independent of the pipeline and supervisor
//! - Every `interval`: trigger a device-counter snapshot, read capacity and
//!   write amplification, append one `TelemetrySample`
//! - Stop via a broadcast channel; the task is joined before `stop` returns
//!
//! The first sample is taken one full interval after `start`, so a sampler
//! stopped after 950 s with a 300 s interval holds exactly three samples.
//! A stop request abandons an in-flight sample instead of waiting for a
//! slow remote call.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::common::{shutdown_channel, BenchResult, BestEffort, ShutdownReceiver, ShutdownSender};
use crate::remote::RemoteShell;
use crate::volume::Volume;

/// One timestamped device-counter reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the sampler started
    pub elapsed_secs: f64,
    /// Bytes used on the volume, `None` if unavailable
    pub capacity_used: Option<u64>,
    /// Device write-amplification figure, `None` if unavailable
    pub write_amplification: Option<f64>,
}

/// Where samples come from
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Ask the device layer to write its counters out
    async fn snapshot(&self) -> BestEffort<()>;
    async fn capacity_used(&self) -> BestEffort<u64>;
    async fn write_amplification(&self) -> BestEffort<f64>;
}

/// Samples the mounted volume and the remote telemetry host
pub struct DeviceTelemetry {
    volume: Arc<Volume>,
    remote: RemoteShell,
}

impl DeviceTelemetry {
    pub fn new(volume: Arc<Volume>, remote: RemoteShell) -> Self {
        Self { volume, remote }
    }
}

#[async_trait]
impl TelemetrySource for DeviceTelemetry {
    async fn snapshot(&self) -> BestEffort<()> {
        self.volume.snapshot().await
    }

    async fn capacity_used(&self) -> BestEffort<u64> {
        self.volume
            .capacity_used()
            .await
            .warn_on_failure("capacity read")
    }

    async fn write_amplification(&self) -> BestEffort<f64> {
        self.remote
            .write_amplification()
            .await
            .warn_on_failure("write amplification read")
    }
}

/// Append-only sample log, optionally mirrored to a JSON-lines file
///
/// Timestamps are strictly increasing: a sample stamped at or before its
/// predecessor is moved one microsecond past it.
#[derive(Debug, Clone, Default)]
pub struct SampleLog {
    path: Option<PathBuf>,
    samples: Arc<RwLock<Vec<TelemetrySample>>>,
}

impl SampleLog {
    /// In-memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Create (truncate) the backing file
    pub fn create(path: impl Into<PathBuf>) -> BenchResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        Ok(Self {
            path: Some(path),
            samples: Arc::default(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a sample, returning it as stored
    pub fn append(&self, mut sample: TelemetrySample) -> BenchResult<TelemetrySample> {
        let mut samples = self.samples.write();
        if let Some(last) = samples.last() {
            if sample.timestamp <= last.timestamp {
                sample.timestamp = last.timestamp + chrono::Duration::microseconds(1);
            }
        }
        if let Some(ref path) = self.path {
            let mut file = OpenOptions::new().append(true).open(path)?;
            let line = serde_json::to_string(&sample)?;
            writeln!(file, "{}", line)?;
        }
        samples.push(sample.clone());
        Ok(sample)
    }

    /// Copy of every sample appended so far
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.samples.read().clone()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// Read a JSON-lines sample file written by `create`/`append`
    pub fn read(path: &Path) -> BenchResult<Vec<TelemetrySample>> {
        let reader = BufReader::new(File::open(path)?);
        let mut samples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            samples.push(serde_json::from_str(&line)?);
        }
        Ok(samples)
    }
}

/// Running sampler; dropping it without `stop` leaves the task running
pub struct SamplerHandle {
    stop_tx: ShutdownSender,
    task: JoinHandle<()>,
    log: SampleLog,
}

impl SamplerHandle {
    /// Samples appended so far
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.log.samples()
    }

    /// Stop sampling and wait for the task to exit
    pub async fn stop(self) -> Vec<TelemetrySample> {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Telemetry sampler task failed");
        }
        let samples = self.log.samples();
        info!(samples = samples.len(), "Telemetry sampler stopped");
        samples
    }
}

/// Periodic device-counter sampler
pub struct Sampler;

impl Sampler {
    /// Start sampling `source` into `log` every `interval`
    pub fn start(
        source: Arc<dyn TelemetrySource>,
        log: SampleLog,
        interval: Duration,
    ) -> SamplerHandle {
        let (stop_tx, stop_rx) = shutdown_channel();
        let task_log = log.clone();
        info!(interval_secs = interval.as_secs(), "Telemetry sampler started");
        let task = tokio::spawn(async move {
            sampling_loop(source, task_log, interval, stop_rx).await;
        });
        SamplerHandle { stop_tx, task, log }
    }
}

async fn sampling_loop(
    source: Arc<dyn TelemetrySource>,
    log: SampleLog,
    interval: Duration,
    mut stop: ShutdownReceiver,
) {
    let started = Instant::now();
    let mut ticker = time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.recv() => break,

            _ = ticker.tick() => {}
        }

        let sample = tokio::select! {
            biased;

            _ = stop.recv() => {
                debug!("Stop requested during sample, abandoning it");
                break;
            }

            sample = collect(source.as_ref(), started) => sample,
        };

        match log.append(sample) {
            Ok(stored) => debug!(
                elapsed_secs = stored.elapsed_secs,
                capacity_used = ?stored.capacity_used,
                waf = ?stored.write_amplification,
                "Telemetry sample"
            ),
            Err(e) => warn!(error = %e, "Failed to append telemetry sample"),
        }
    }
}

async fn collect(source: &dyn TelemetrySource, started: Instant) -> TelemetrySample {
    let _ = source.snapshot().await;
    let capacity_used = source.capacity_used().await.value();
    let write_amplification = source.write_amplification().await.value();
    TelemetrySample {
        timestamp: Utc::now(),
        elapsed_secs: started.elapsed().as_secs_f64(),
        capacity_used,
        write_amplification,
    }
}

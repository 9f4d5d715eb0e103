//! Trial orchestration
//!
//! One trial is a single foreground flow plus two concurrent activities
//! (the telemetry sampler task and the supervised out-of-process workload):
//!
//! ```text
//!   prepare volume ─► reset counters ─► start sampler
//!        ─► start `before_pipeline` processes
//!        ─► chunked pipeline
//!        ─► start `after_pipeline` processes, await readiness
//!        ─► steady state ─► live scrape ─► staged shutdown
//!        ─► stop sampler ─► final reads ─► extract + persist
//!   cleanup (always, exactly once): stop sampler, shutdown, teardown
//! ```
//!
//! All per-trial state lives in `TrialContext`. Ctrl+C aborts the flow with
//! `BenchError::Interrupted`; cleanup still runs.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::common::{
    shutdown_requested, BenchError, BenchResult, PollTimer, ShutdownReceiver, Tick,
};
use crate::config::{BenchConfig, ProcessConfig, StartPhase, TrialConfig, TrialKind};
use crate::extract::{self, MetricSources, MetricsRecord};
use crate::host::{find_program, Host, LaunchSpec};
use crate::pipeline::{run_chunked, CommandStages};
use crate::remote::RemoteShell;
use crate::report::{self, ComparisonReport};
use crate::supervisor::{
    AlwaysReady, HttpProbe, ReadinessProbe, Role, ShutdownOutcome, ShutdownPolicy,
    SpawnRequest, Supervisor,
};
use crate::telemetry::{DeviceTelemetry, SampleLog, Sampler, SamplerHandle};
use crate::volume::Volume;

/// Programs every trial needs regardless of configuration
const HOST_PROGRAMS: &[&str] = &["mount", "umount", "mkdir", "chmod", "df", "setsid", "pgrep"];

/// Verify binaries and the device node before anything is provisioned
pub fn check_environment(config: &BenchConfig) -> BenchResult<()> {
    let mut programs: Vec<&str> = HOST_PROGRAMS.to_vec();
    programs.push(&config.device.mkfs_program);
    if config.remote.target_host().is_some() {
        programs.push(&config.remote.ssh_program);
    }
    if config.dataset.total_units > 0 {
        for stage in [&config.dataset.fetch, &config.dataset.transform, &config.dataset.load]
            .into_iter()
            .flatten()
        {
            programs.push(&stage.program);
        }
    }
    programs.extend(config.processes.iter().map(|p| p.program.as_str()));

    let mut missing: Vec<String> = Vec::new();
    for program in programs {
        // Templated programs are resolved per trial
        if program.contains('{') || find_program(program).is_some() {
            continue;
        }
        let entry = format!("program '{}'", program);
        if !missing.contains(&entry) {
            missing.push(entry);
        }
    }

    if !config.device.path.exists() {
        missing.push(format!("device {}", config.device.path.display()));
    }
    if find_program("lsof").is_none() && !config.all_ports().is_empty() {
        warn!("lsof not found, orphaned port holders will not be reclaimed");
    }

    if missing.is_empty() {
        info!("Environment check passed");
        Ok(())
    } else {
        Err(BenchError::missing(missing.join(", ")))
    }
}

/// Explicit state of one trial
pub struct TrialContext<'a> {
    pub host: &'a Host,
    pub config: &'a BenchConfig,
    pub trial: TrialConfig,
    pub volume: Arc<Volume>,
    pub remote: RemoteShell,
    pub supervisor: Supervisor,
    sampler: Option<SamplerHandle>,
    cleaned_up: bool,
}

impl<'a> TrialContext<'a> {
    pub fn new(host: &'a Host, config: &'a BenchConfig, kind: TrialKind) -> Self {
        let trial = TrialConfig::new(config, kind);
        let remote = RemoteShell::new(host.runner.clone(), config.remote.clone());
        let volume = Arc::new(Volume::new(
            config.device.clone(),
            host.runner.clone(),
            remote.clone(),
        ));
        let policy = ShutdownPolicy {
            grace: Duration::from_secs(config.shutdown_wait_secs),
            ..ShutdownPolicy::default()
        };
        let supervisor = Supervisor::new(host.processes.clone(), policy)
            .with_discovery_timeout(Duration::from_secs(config.pid_discovery_secs))
            .with_ports(config.all_ports());
        Self {
            host,
            config,
            trial,
            volume,
            remote,
            supervisor,
            sampler: None,
            cleaned_up: false,
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.trial.output_dir.join("logs").join(format!("{}.log", name))
    }

    /// Everything between provisioning and the persisted metrics record
    pub async fn run_stages(&mut self) -> BenchResult<MetricsRecord> {
        let label = self.trial.label.clone();
        info!(
            trial = %label,
            streams = self.trial.stream_count,
            placement = %self.trial.placement_mode,
            "Starting trial"
        );

        self.volume.prepare(self.trial.stream_count).await?;
        let _ = self.volume.reset().await;

        std::fs::create_dir_all(&self.trial.output_dir)?;
        for tier in &self.trial.tiers {
            std::fs::create_dir_all(&tier.dir)?;
        }

        let log = SampleLog::create(self.trial.output_dir.join(&self.config.telemetry.file_name))?;
        let source = Arc::new(DeviceTelemetry::new(self.volume.clone(), self.remote.clone()));
        self.sampler = Some(Sampler::start(
            source,
            log,
            Duration::from_secs(self.config.telemetry.interval_secs),
        ));

        self.start_processes(StartPhase::BeforePipeline).await?;

        let stages = CommandStages::new(self.host.runner.clone(), &self.config.dataset)
            .with_trial(&self.trial);
        let pipeline = run_chunked(
            self.trial.total_units,
            self.trial.chunk_size,
            &self.trial.staging_dir,
            &stages,
        )
        .await?;

        self.start_processes(StartPhase::AfterPipeline).await?;

        let elapsed = if self.supervisor.handles().is_empty() {
            pipeline.elapsed
        } else {
            self.steady_state().await
        };

        let scrapes = self.scrape_all().await;
        let _ = self.volume.snapshot().await;

        let shutdown = self.supervisor.shutdown_all().await?;
        let samples = match self.sampler.take() {
            Some(sampler) => sampler.stop().await,
            None => Vec::new(),
        };
        let final_capacity = self.volume.capacity_used().await.value();
        let final_waf = self
            .remote
            .write_amplification()
            .await
            .warn_on_failure("final write amplification read")
            .value();

        let reporting = self.config.reporting_process().map(|p| p.name.clone());
        let handle = reporting
            .as_deref()
            .and_then(|name| self.supervisor.handles().iter().find(|h| h.name == name));
        let shutdown_outcome = handle.and_then(|h| {
            shutdown
                .outcomes
                .iter()
                .find(|(id, _)| *id == h.id)
                .map(|(_, outcome)| *outcome)
        });
        if shutdown_outcome == Some(ShutdownOutcome::Forced) {
            warn!(trial = %label, "Reporting process was force-killed");
        }
        let log_text = handle.and_then(|h| std::fs::read_to_string(&h.log_path).ok());
        let scrape_text = reporting.as_deref().and_then(|name| {
            scrapes
                .iter()
                .find(|(n, _)| n == name)
                .and_then(|(_, text)| text.clone())
        });

        let record = extract::extract(&MetricSources {
            trial_label: &label,
            stream_count: self.trial.stream_count,
            counters: &self.config.counters,
            log_text,
            shutdown_outcome,
            scrape_text,
            samples: &samples,
            final_capacity,
            final_write_amplification: final_waf,
            elapsed,
        });
        let path = record.persist(&self.trial.output_dir)?;
        info!(trial = %label, metrics = %path.display(), "Trial complete");
        Ok(record)
    }

    async fn start_processes(&mut self, phase: StartPhase) -> BenchResult<()> {
        let processes: Vec<ProcessConfig> = self
            .config
            .processes
            .iter()
            .filter(|p| p.start == phase)
            .cloned()
            .collect();
        for process in processes {
            let id = self.supervisor.spawn(self.spawn_request(&process)).await?;
            let probe: Box<dyn ReadinessProbe> = match process.ready_url {
                Some(ref url) => {
                    let url = self.trial.expand(url);
                    Box::new(HttpProbe::new(self.host.http.clone(), url))
                }
                None => Box::new(AlwaysReady),
            };
            self.supervisor
                .await_ready(
                    id,
                    probe.as_ref(),
                    Duration::from_secs(self.config.ready_timeout_secs),
                    Duration::from_millis(self.config.ready_poll_ms.max(1)),
                )
                .await?;
        }
        Ok(())
    }

    fn spawn_request(&self, process: &ProcessConfig) -> SpawnRequest {
        let mut env = self.trial.process_env();
        env.extend(
            process
                .env
                .iter()
                .map(|(k, v)| (k.clone(), self.trial.expand(v))),
        );
        SpawnRequest {
            name: process.name.clone(),
            role: process.role,
            launch: LaunchSpec {
                program: self.trial.expand(&process.program),
                args: process.args.iter().map(|a| self.trial.expand(a)).collect(),
                env,
                log_path: self.log_path(&process.name),
            },
            pid_pattern: self.trial.expand(process.pid_pattern()),
            metrics_url: process.metrics_url.as_deref().map(|u| self.trial.expand(u)),
        }
    }

    /// Let the workload run; ends early once every benchmark client exited
    async fn steady_state(&self) -> Duration {
        let started = Instant::now();
        let limit = Duration::from_secs(self.config.run_secs);
        info!(trial = %self.trial.label, run_secs = limit.as_secs(), "Steady state");

        let clients: Vec<u32> = self
            .supervisor
            .handles()
            .iter()
            .filter(|h| h.role == Role::BenchmarkClient)
            .map(|h| h.pid)
            .collect();
        let mut reported_dead = HashSet::new();
        let period = Duration::from_secs(1).min(limit.max(Duration::from_millis(1)));
        let mut timer = PollTimer::new(period, limit);
        while let Tick::Poll = timer.tick().await {
            for handle in self.supervisor.handles() {
                if handle.role != Role::BenchmarkClient
                    && !self.host.processes.is_alive(handle.pid)
                    && reported_dead.insert(handle.pid)
                {
                    error!(
                        name = %handle.name,
                        pid = handle.pid,
                        "Process died during steady state"
                    );
                }
            }
            let clients_done = clients.iter().all(|pid| !self.host.processes.is_alive(*pid));
            if !clients.is_empty() && clients_done {
                info!(elapsed_secs = started.elapsed().as_secs(), "Benchmark clients finished");
                break;
            }
        }
        started.elapsed()
    }

    /// Scrape every metrics endpoint concurrently
    async fn scrape_all(&self) -> Vec<(String, Option<String>)> {
        let targets: Vec<(String, String)> = self
            .supervisor
            .handles()
            .iter()
            .filter_map(|h| Some((h.name.clone(), h.metrics_url.clone()?)))
            .collect();
        let http = self.host.http.clone();
        let results = join_all(targets.into_iter().map(|(name, url)| {
            let http = http.clone();
            async move {
                let body = match http.get(&url).await {
                    Ok(resp) if resp.is_success() => Some(resp.body),
                    Ok(resp) => {
                        warn!(name = %name, status = resp.status, "Metrics scrape rejected");
                        None
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "Metrics scrape failed");
                        None
                    }
                };
                (name, body)
            }
        }))
        .await;

        for (name, body) in &results {
            if let Some(text) = body {
                let path = self.trial.output_dir.join(format!("{}.scrape.txt", name));
                if let Err(e) = std::fs::write(&path, text) {
                    warn!(path = %path.display(), error = %e, "Failed to keep scrape");
                }
            }
        }
        results
    }

    /// Stop the sampler, stop every process and tear down the volume
    ///
    /// Runs its body at most once; failures are logged, not returned.
    pub async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        info!(trial = %self.trial.label, "Cleaning up trial");

        if let Some(sampler) = self.sampler.take() {
            sampler.stop().await;
        }
        if let Err(e) = self.supervisor.shutdown_all().await {
            warn!(error = %e, "Process shutdown during cleanup failed");
        }
        if let Err(e) = self.volume.teardown().await {
            warn!(error = %e, "Volume teardown failed");
        }
    }
}

/// Run one trial end to end
///
/// Cleanup runs exactly once whether the trial succeeded, failed or was
/// interrupted.
pub async fn run_trial(
    host: &Host,
    config: &BenchConfig,
    kind: TrialKind,
    mut shutdown: ShutdownReceiver,
) -> BenchResult<MetricsRecord> {
    let mut ctx = TrialContext::new(host, config, kind);
    let label = ctx.trial.label.clone();
    let result = tokio::select! {
        biased;

        Ok(()) = shutdown.recv() => {
            warn!(trial = %label, "Interrupted, cleaning up");
            Err(BenchError::Interrupted)
        }

        result = ctx.run_stages() => result,
    };
    if let Err(ref e) = result {
        error!(trial = %label, error = %e, "Trial failed");
    }
    ctx.cleanup().await;
    result
}

/// Run baseline then treatment and write the comparison artifacts
///
/// A shutdown that arrives between trials, including during baseline
/// cleanup, stops the comparison before the treatment provisions.
pub async fn run_comparison(
    host: &Host,
    config: &BenchConfig,
    shutdown: &mut ShutdownReceiver,
) -> BenchResult<ComparisonReport> {
    let mut records = Vec::with_capacity(2);
    for kind in [TrialKind::Baseline, TrialKind::Treatment] {
        if shutdown_requested(shutdown) {
            warn!(trial = %kind, "Interrupted before trial start");
            return Err(BenchError::Interrupted);
        }
        records.push(run_trial(host, config, kind, shutdown.resubscribe()).await?);
    }
    let (baseline, treatment) = (&records[0], &records[1]);
    let report = report::compare(baseline, treatment);
    report::write_artifacts(&report, &config.output_dir)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_environment_reports_missing_pieces() {
        let mut config = BenchConfig::default();
        config.device.mkfs_program = "mkfs.placement-bench-missing".to_string();
        config.device.path = PathBuf::from("/dev/placement-bench-missing");
        let err = check_environment(&config).unwrap_err();
        assert!(matches!(err, BenchError::MissingPrerequisite(_)));
        let msg = err.to_string();
        assert!(msg.contains("mkfs.placement-bench-missing"));
        assert!(msg.contains("/dev/placement-bench-missing"));
    }

    #[test]
    fn test_check_environment_skips_templated_programs() {
        let mut config = BenchConfig::default();
        config.device.path = PathBuf::from("/dev/placement-bench-missing");
        config.processes.push(ProcessConfig {
            name: "node".to_string(),
            role: Role::Producer,
            program: "{mount}/bin/node".to_string(),
            start: StartPhase::AfterPipeline,
            args: vec![],
            env: Default::default(),
            pid_pattern: None,
            ready_url: None,
            metrics_url: None,
            ports: vec![],
        });
        let msg = check_environment(&config).unwrap_err().to_string();
        assert!(!msg.contains("{mount}"));
    }

    #[test]
    fn test_check_environment_ignores_ssh_without_remote_host() {
        let mut config = BenchConfig::default();
        config.device.path = PathBuf::from("/dev/placement-bench-missing");
        config.remote.ssh_program = "ssh-placement-bench-missing".to_string();

        config.remote.host = Some(String::new());
        let msg = check_environment(&config).unwrap_err().to_string();
        assert!(!msg.contains("ssh-placement-bench-missing"));

        config.remote.host = Some("fdp-host".to_string());
        let msg = check_environment(&config).unwrap_err().to_string();
        assert!(msg.contains("ssh-placement-bench-missing"));
    }
}

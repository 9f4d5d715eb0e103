//! Process lifecycle supervisor
//!
//! Starts long-running dependent processes detached from the controlling
//! session, waits for each to pass a readiness probe and stops them with a
//! staged protocol:
//!
//! ```text
//!   Spawned ─► ReadyProbePending ─► Running ─► Signaled ─► Terminated
//!      │               │               │           │
//!      └───────────────┴───────────────┘           └────► ForceKilled
//!                 (exited on its own)
//!                      ▼
//!                  Terminated
//! ```
//!
//! Transitions only move forward. Shutdown walks handles in reverse
//! dependency order (benchmark clients, then consumers, then producers),
//! sends SIGTERM, polls liveness once per second up to the grace period,
//! escalates to SIGKILL and finally reclaims anything still bound to the
//! workload's well-known ports.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{BenchError, BenchResult, PollTimer, Tick};
use crate::host::{HttpFetcher, LaunchSpec, ProcessTable, Signal};

/// Lines of a process log attached to fatal errors
pub const LOG_TAIL_LINES: usize = 40;

/// Role of a dependent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owns the store and serves data to consumers
    Producer,
    /// Drives or follows a producer
    Consumer,
    /// Standalone benchmark client
    BenchmarkClient,
}

impl Role {
    /// Lower ranks are stopped first
    fn shutdown_rank(self) -> u8 {
        match self {
            Role::BenchmarkClient => 0,
            Role::Consumer => 1,
            Role::Producer => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
            Role::BenchmarkClient => write!(f, "benchmark-client"),
        }
    }
}

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawned,
    ReadyProbePending,
    Running,
    Signaled,
    Terminated,
    ForceKilled,
}

impl ProcessState {
    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, target),
            // Normal flow
            (Spawned, ReadyProbePending)
            | (ReadyProbePending, Running)
            | (Running, Signaled)
            | (Signaled, Terminated)
            | (Signaled, ForceKilled)
            // Shutdown before readiness completed
            | (Spawned, Signaled)
            | (ReadyProbePending, Signaled)
            // Exited on its own
            | (Spawned, Terminated)
            | (ReadyProbePending, Terminated)
            | (Running, Terminated)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::ForceKilled)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Spawned => "Spawned",
            ProcessState::ReadyProbePending => "ReadyProbePending",
            ProcessState::Running => "Running",
            ProcessState::Signaled => "Signaled",
            ProcessState::Terminated => "Terminated",
            ProcessState::ForceKilled => "ForceKilled",
        };
        write!(f, "{}", s)
    }
}

/// Bounded-wait parameters of the staged shutdown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShutdownPolicy {
    /// How long to wait after SIGTERM before SIGKILL
    pub grace: Duration,
    /// Liveness polling resolution
    pub poll: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            poll: Duration::from_secs(1),
        }
    }
}

/// How a process reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Exited within the grace period after SIGTERM
    Graceful,
    /// Exited on its own before being signalled
    Exited,
    /// Needed SIGKILL
    Forced,
}

impl ShutdownOutcome {
    /// True when the process had the chance to flush its final counters
    pub fn flushed_counters(&self) -> bool {
        matches!(self, ShutdownOutcome::Graceful | ShutdownOutcome::Exited)
    }
}

/// Index of a handle inside its supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(usize);

/// A supervised dependent process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: HandleId,
    pub name: String,
    pub role: Role,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub log_path: PathBuf,
    pub metrics_url: Option<String>,
    pub policy: ShutdownPolicy,
    state: ProcessState,
    outcome: Option<ShutdownOutcome>,
}

impl ProcessHandle {
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Set once the handle is terminal
    pub fn shutdown_outcome(&self) -> Option<ShutdownOutcome> {
        self.outcome
    }

    fn advance(&mut self, next: ProcessState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            warn!(
                name = %self.name,
                from = %self.state,
                to = %next,
                "Ignoring backward process state transition"
            );
        }
    }

    fn finish(&mut self, next: ProcessState, outcome: ShutdownOutcome) {
        self.advance(next);
        if self.state.is_terminal() && self.outcome.is_none() {
            self.outcome = Some(outcome);
        }
    }
}

/// What to launch and how to recognise it
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub role: Role,
    pub launch: LaunchSpec,
    pub pid_pattern: String,
    pub metrics_url: Option<String>,
}

/// Health check deciding a process is ready
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Ready once the URL answers with a 2xx status
pub struct HttpProbe {
    http: Arc<dyn HttpFetcher>,
    url: String,
}

impl HttpProbe {
    pub fn new(http: Arc<dyn HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self) -> bool {
        match self.http.get(&self.url).await {
            Ok(response) => response.is_success(),
            Err(_) => false,
        }
    }
}

/// Probe for processes without a health endpoint: liveness is enough
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn check(&self) -> bool {
        true
    }
}

/// Result of one `shutdown` call
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<(HandleId, ShutdownOutcome)>,
    /// Orphans killed by port-based cleanup
    pub reclaimed: Vec<u32>,
}

/// Owns every process handle of a trial
pub struct Supervisor {
    table: Arc<dyn ProcessTable>,
    handles: Vec<ProcessHandle>,
    policy: ShutdownPolicy,
    discovery_timeout: Duration,
    discovery_poll: Duration,
    ports: Vec<u16>,
}

impl Supervisor {
    pub fn new(table: Arc<dyn ProcessTable>, policy: ShutdownPolicy) -> Self {
        Self {
            table,
            handles: Vec::new(),
            policy,
            discovery_timeout: Duration::from_secs(15),
            discovery_poll: Duration::from_millis(250),
            ports: Vec::new(),
        }
    }

    /// How long to search the process table after a detached launch
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Ports reclaimed after every shutdown
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn handle(&self, id: HandleId) -> Option<&ProcessHandle> {
        self.handles.get(id.0)
    }

    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    /// True once every handle has reached a terminal state
    pub fn all_terminal(&self) -> bool {
        self.handles.iter().all(|h| h.state.is_terminal())
    }

    /// Launch a process detached and discover its real pid
    pub async fn spawn(&mut self, request: SpawnRequest) -> BenchResult<HandleId> {
        info!(
            name = %request.name,
            role = %request.role,
            program = %request.launch.program,
            "Spawning"
        );
        self.table.launch_detached(&request.launch).await?;

        let mut timer = PollTimer::new(self.discovery_poll, self.discovery_timeout);
        let pid = loop {
            match timer.tick().await {
                Tick::Poll => {
                    if let Some(pid) = self.table.find_pid(&request.pid_pattern).await {
                        break pid;
                    }
                }
                Tick::Expired | Tick::Cancelled => {
                    return Err(BenchError::PidNotFound {
                        role: request.role,
                        pattern: request.pid_pattern,
                        log_tail: log_tail(&request.launch.log_path, LOG_TAIL_LINES),
                    });
                }
            }
        };

        let id = HandleId(self.handles.len());
        info!(name = %request.name, pid, "Process started");
        self.handles.push(ProcessHandle {
            id,
            name: request.name,
            role: request.role,
            pid,
            start_time: Utc::now(),
            log_path: request.launch.log_path,
            metrics_url: request.metrics_url,
            policy: self.policy,
            state: ProcessState::Spawned,
            outcome: None,
        });
        Ok(id)
    }

    /// Poll `probe` until it succeeds, the process dies, or `timeout` passes
    pub async fn await_ready(
        &mut self,
        id: HandleId,
        probe: &dyn ReadinessProbe,
        timeout: Duration,
        poll: Duration,
    ) -> BenchResult<()> {
        let table = self.table.clone();
        let handle = self
            .handles
            .get_mut(id.0)
            .ok_or_else(|| BenchError::other(format!("unknown process handle {:?}", id)))?;
        handle.advance(ProcessState::ReadyProbePending);

        let mut timer = PollTimer::new(poll, timeout);
        loop {
            let expired = !matches!(timer.tick().await, Tick::Poll);

            if !table.is_alive(handle.pid) {
                handle.finish(ProcessState::Terminated, ShutdownOutcome::Exited);
                return Err(BenchError::ProcessDied {
                    role: handle.role,
                    pid: handle.pid,
                    log_tail: log_tail(&handle.log_path, LOG_TAIL_LINES),
                });
            }
            if expired {
                return Err(BenchError::NotReady {
                    role: handle.role,
                    waited_secs: timeout.as_secs(),
                    log_tail: log_tail(&handle.log_path, LOG_TAIL_LINES),
                });
            }
            if probe.check().await {
                handle.advance(ProcessState::Running);
                info!(
                    name = %handle.name,
                    pid = handle.pid,
                    waited_ms = timer.elapsed().as_millis() as u64,
                    "Process ready"
                );
                return Ok(());
            }
        }
    }

    /// Staged shutdown of the given handles; idempotent
    pub async fn shutdown(&mut self, ids: &[HandleId]) -> BenchResult<ShutdownReport> {
        let mut order: Vec<usize> = ids.iter().map(|id| id.0).collect();
        if let Some(bad) = order.iter().find(|i| **i >= self.handles.len()) {
            return Err(BenchError::other(format!("unknown process handle {}", bad)));
        }
        // Dependents first; later spawns first within a role
        order.sort_by_key(|i| (self.handles[*i].role.shutdown_rank(), std::cmp::Reverse(*i)));
        order.dedup();

        let mut report = ShutdownReport::default();
        for idx in order {
            let table = self.table.clone();
            let handle = &mut self.handles[idx];
            if let Some(outcome) = handle.outcome {
                report.outcomes.push((handle.id, outcome));
                continue;
            }
            let outcome = stop_one(table.as_ref(), handle).await;
            report.outcomes.push((handle.id, outcome));
        }

        report.reclaimed = self.reclaim_ports().await;
        Ok(report)
    }

    /// Shut down every handle
    pub async fn shutdown_all(&mut self) -> BenchResult<ShutdownReport> {
        let ids: Vec<HandleId> = self.handles.iter().map(|h| h.id).collect();
        self.shutdown(&ids).await
    }

    /// Kill whatever still holds a workload port
    async fn reclaim_ports(&self) -> Vec<u32> {
        let mut reclaimed = Vec::new();
        for port in &self.ports {
            for pid in self.table.pids_on_port(*port).await {
                if pid == std::process::id() || reclaimed.contains(&pid) {
                    continue;
                }
                warn!(port, pid, "Killing orphan still bound to workload port");
                if let Err(e) = self.table.signal(pid, Signal::Kill) {
                    warn!(pid, error = %e, "Failed to kill orphan");
                }
                reclaimed.push(pid);
            }
        }
        reclaimed
    }
}

async fn stop_one(table: &dyn ProcessTable, handle: &mut ProcessHandle) -> ShutdownOutcome {
    if !table.is_alive(handle.pid) {
        info!(name = %handle.name, pid = handle.pid, "Process already exited");
        handle.finish(ProcessState::Terminated, ShutdownOutcome::Exited);
        return ShutdownOutcome::Exited;
    }

    info!(name = %handle.name, pid = handle.pid, role = %handle.role, "Sending SIGTERM");
    if let Err(e) = table.signal(handle.pid, Signal::Terminate) {
        warn!(name = %handle.name, error = %e, "SIGTERM failed");
    }
    handle.advance(ProcessState::Signaled);

    let mut timer = PollTimer::new(handle.policy.poll, handle.policy.grace);
    while let Tick::Poll = timer.tick().await {
        if !table.is_alive(handle.pid) {
            info!(
                name = %handle.name,
                waited_secs = timer.elapsed().as_secs(),
                "Process stopped gracefully"
            );
            handle.finish(ProcessState::Terminated, ShutdownOutcome::Graceful);
            return ShutdownOutcome::Graceful;
        }
    }

    warn!(
        name = %handle.name,
        pid = handle.pid,
        grace_secs = handle.policy.grace.as_secs(),
        "Process still alive after grace period, sending SIGKILL"
    );
    if let Err(e) = table.signal(handle.pid, Signal::Kill) {
        warn!(name = %handle.name, error = %e, "SIGKILL failed");
    }
    handle.finish(ProcessState::ForceKilled, ShutdownOutcome::Forced);
    ShutdownOutcome::Forced
}

/// Last `lines` lines of a log file, for diagnostics
pub fn log_tail(path: &Path, lines: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let all: Vec<&str> = text.lines().collect();
            all[all.len().saturating_sub(lines)..].join("\n")
        }
        Err(e) => format!("(log {} unavailable: {})", path.display(), e),
    }
}

//! Scripted host for trial-level tests
//!
//! `FakeRunner`, `FakeTable` and `FakeHttp` stand in for the shell, the
//! process table and HTTP so a whole trial can run under paused time.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use placement_bench::common::{BenchError, BenchResult};
use placement_bench::config::BenchConfig;
use placement_bench::host::{
    CommandOutput, CommandRunner, CommandSpec, Host, HttpFetcher, HttpResponse, LaunchSpec,
    ProcessTable, Signal,
};

/// Bytes reported by the fake `df`
pub const DF_USED: u64 = 1_048_576;

/// Records every command; replies by command-line prefix
#[derive(Default)]
pub struct FakeRunner {
    seen: Mutex<Vec<String>>,
    replies: Mutex<Vec<(String, CommandOutput)>>,
}

impl FakeRunner {
    pub fn reply(&self, prefix: &str, output: CommandOutput) {
        self.replies.lock().push((prefix.to_string(), output));
    }

    pub fn lines(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput> {
        let line = cmd.command_line();
        self.seen.lock().push(line.clone());
        if let Some((_, out)) = self
            .replies
            .lock()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            return Ok(out.clone());
        }
        if cmd.program == "df" {
            return Ok(CommandOutput::ok(format!("     Used\n{}\n", DF_USED)));
        }
        Ok(CommandOutput::ok(""))
    }
}

#[derive(Default)]
struct TableState {
    next_pid: u32,
    by_program: HashMap<String, u32>,
    alive: HashSet<u32>,
    ignores_term: HashSet<String>,
    log_text: HashMap<String, String>,
    launched: Vec<LaunchSpec>,
    signals: Vec<(u32, Signal)>,
}

/// Process table whose processes live until signalled
#[derive(Default)]
pub struct FakeTable(Mutex<TableState>);

impl FakeTable {
    /// Text the process "writes" to its log when launched
    pub fn log_on_launch(&self, program: &str, text: &str) {
        self.0
            .lock()
            .log_text
            .insert(program.to_string(), text.to_string());
    }

    /// The process survives SIGTERM and has to be killed
    pub fn ignore_term(&self, program: &str) {
        self.0.lock().ignores_term.insert(program.to_string());
    }

    pub fn pid_of(&self, program: &str) -> Option<u32> {
        self.0.lock().by_program.get(program).copied()
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self, program: &str) {
        let mut s = self.0.lock();
        if let Some(pid) = s.by_program.get(program).copied() {
            s.alive.remove(&pid);
        }
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.0.lock().signals.clone()
    }

    pub fn launched(&self) -> Vec<LaunchSpec> {
        self.0.lock().launched.clone()
    }

    pub fn alive_count(&self) -> usize {
        self.0.lock().alive.len()
    }
}

#[async_trait]
impl ProcessTable for FakeTable {
    async fn launch_detached(&self, spec: &LaunchSpec) -> BenchResult<()> {
        let text = {
            let mut s = self.0.lock();
            s.next_pid += 1;
            let pid = 4000 + s.next_pid;
            s.by_program.insert(spec.program.clone(), pid);
            s.alive.insert(pid);
            s.launched.push(spec.clone());
            s.log_text.get(&spec.program).cloned().unwrap_or_default()
        };
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&spec.log_path, text)?;
        Ok(())
    }

    async fn find_pid(&self, pattern: &str) -> Option<u32> {
        self.0.lock().by_program.get(pattern).copied()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.0.lock().alive.contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> BenchResult<()> {
        let mut s = self.0.lock();
        s.signals.push((pid, signal));
        let stubborn = s
            .by_program
            .iter()
            .any(|(program, p)| *p == pid && s.ignores_term.contains(program));
        if signal == Signal::Kill || !stubborn {
            s.alive.remove(&pid);
        }
        Ok(())
    }

    async fn pids_on_port(&self, _port: u16) -> Vec<u32> {
        Vec::new()
    }
}

/// Scripted GET responses; unknown URLs refuse the connection
#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<String, HttpResponse>>,
    hits: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub fn route(&self, url: &str, status: u16, body: &str) {
        self.routes.lock().insert(
            url.to_string(),
            HttpResponse {
                status,
                body: body.to_string(),
            },
        );
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl HttpFetcher for FakeHttp {
    async fn get(&self, url: &str) -> BenchResult<HttpResponse> {
        self.hits.lock().push(url.to_string());
        self.routes
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| BenchError::Http(format!("connection refused: {}", url)))
    }
}

/// A fake host plus handles to each fake
pub struct TestHost {
    pub host: Host,
    pub runner: Arc<FakeRunner>,
    pub table: Arc<FakeTable>,
    pub http: Arc<FakeHttp>,
}

impl TestHost {
    pub fn new() -> Self {
        let runner = Arc::new(FakeRunner::default());
        let table = Arc::new(FakeTable::default());
        let http = Arc::new(FakeHttp::default());
        let host = Host {
            runner: runner.clone(),
            processes: table.clone(),
            http: http.clone(),
        };
        Self {
            host,
            runner,
            table,
            http,
        }
    }
}

/// Config rooted in `root` with one producer node and no dataset
pub fn node_config(root: &Path) -> BenchConfig {
    node_config_with(root, "")
}

/// `node_config` plus extra TOML tables appended after the node
pub fn node_config_with(root: &Path, extra: &str) -> BenchConfig {
    let toml = format!(
        r#"
output_dir = "{root}/results"
run_secs = 10
ready_timeout_secs = 5
ready_poll_ms = 500
shutdown_wait_secs = 30
pid_discovery_secs = 2

[device]
path = "/dev/fake0"
mount_point = "{root}/mnt"
tiers = ["hot", "cold"]

[dataset]
staging_dir = "{root}/staging"

[[process]]
name = "node"
role = "producer"
program = "/opt/node"
args = ["--datadir", "{{tier:hot}}", "--streams", "{{streams}}"]
ready_url = "http://127.0.0.1:8545/health"
metrics_url = "http://127.0.0.1:6060/metrics"
{extra}
"#,
        root = root.display(),
        extra = extra
    );
    let config = BenchConfig::from_toml(&toml).expect("test config");
    config.validate().expect("valid test config");
    config
}
